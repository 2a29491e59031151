//! HTTP 驱动：网关作为 HTTP 客户端访问设备接口。
//!
//! 设备地址为 `{baseUrl}{endpoint}`，`endpoint` 来自设备级配置（默认空）。

use async_trait::async_trait;
use domain::{DataMap, Device, DriverConfig, DriverConfigField, FieldLevel, FieldType};
use gw_driver::{DeviceDriver, DriverBase, DriverContext, DriverDescriptor, DriverError};
use reqwest::header::{AUTHORIZATION, HeaderValue};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DRIVER_TYPE: &str = "HTTP";
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(3);

pub const DESCRIPTOR: DriverDescriptor = DriverDescriptor {
    driver_type: DRIVER_TYPE,
    display_name: "HTTP驱动",
    factory: create,
    fields: config_fields,
};

fn create(config: DriverConfig, context: DriverContext) -> Result<Arc<dyn DeviceDriver>, DriverError> {
    Ok(Arc::new(HttpDriver::new(config, context)?))
}

pub fn config_fields() -> Vec<DriverConfigField> {
    vec![
        DriverConfigField::new("baseUrl", "基础URL", FieldType::Text, FieldLevel::Driver)
            .required()
            .span(24)
            .tip("例如 http://192.168.1.100:8080/api"),
        DriverConfigField::new("authType", "认证方式", FieldType::Select, FieldLevel::Driver)
            .default_value(json!(""))
            .options(&["", "Bearer", "Basic"]),
        DriverConfigField::new("authToken", "认证令牌", FieldType::Password, FieldLevel::Driver),
        DriverConfigField::new("timeout", "超时时间(毫秒)", FieldType::Number, FieldLevel::Driver)
            .default_value(json!(DEFAULT_TIMEOUT_MS))
            .range(1000, 60000),
        DriverConfigField::new("endpoint", "设备路径", FieldType::Text, FieldLevel::Device)
            .tip("拼接在 baseUrl 之后"),
    ]
}

/// 由 `authType`/`authToken` 生成 Authorization 头；未配置或类型未知返回 None。
pub fn authorization(auth_type: Option<&str>, token: Option<&str>) -> Option<String> {
    let token = token?;
    match auth_type? {
        kind if kind.eq_ignore_ascii_case("bearer") => Some(format!("Bearer {token}")),
        kind if kind.eq_ignore_ascii_case("basic") => Some(format!("Basic {token}")),
        _ => None,
    }
}

pub struct HttpDriver {
    base: DriverBase,
    context: DriverContext,
    client: reqwest::Client,
    base_url: String,
    authorization: Option<HeaderValue>,
}

impl HttpDriver {
    pub fn new(config: DriverConfig, context: DriverContext) -> Result<Self, DriverError> {
        let base_url = config
            .require_str("baseUrl")
            .map_err(DriverError::Config)?
            .trim_end_matches('/')
            .to_string();
        let timeout = Duration::from_millis(config.get_u64_or("timeout", DEFAULT_TIMEOUT_MS).max(1));
        let authorization = authorization(config.get_str("authType"), config.get_str("authToken"))
            .map(|value| {
                HeaderValue::from_str(&value)
                    .map_err(|err| DriverError::Config(format!("invalid authToken: {err}")))
            })
            .transpose()?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| DriverError::Config(format!("http client: {err}")))?;
        Ok(Self {
            base: DriverBase::new(config),
            context,
            client,
            base_url,
            authorization,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn device_url(&self, device: &Device, endpoint: Option<&str>) -> String {
        let path = endpoint
            .or_else(|| device.config_str("endpoint"))
            .unwrap_or_default();
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.authorization {
            Some(value) => request.header(AUTHORIZATION, value.clone()),
            None => request,
        }
    }
}

#[async_trait]
impl DeviceDriver for HttpDriver {
    fn config(&self) -> &DriverConfig {
        self.base.config()
    }

    async fn start(&self) -> Result<(), DriverError> {
        self.base
            .start_with(|| async {
                info!(
                    target: "gw.http",
                    base_url = %self.base_url,
                    auth = self.authorization.is_some(),
                    "http_driver_ready"
                );
                Ok(())
            })
            .await
    }

    async fn stop(&self) -> Result<(), DriverError> {
        self.base.stop_with(|| async { Ok(()) }).await
    }

    fn is_running(&self) -> bool {
        self.base.is_running()
    }

    /// GET 设备地址；`endpoint` 参数可覆盖设备配置。
    async fn read_data(&self, device_key: &str, params: &DataMap) -> Result<DataMap, DriverError> {
        self.base.ensure_running()?;
        let device = self.context.require_device(device_key).await?;
        let url = self.device_url(&device, params.get("endpoint").and_then(Value::as_str));
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(DriverError::transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(DriverError::Transport(format!("GET {url} returned {status}")));
        }
        let body: Value = response.json().await.map_err(DriverError::transport)?;
        debug!(target: "gw.http", device_key, url = %url, "http_read_succeeded");
        match body {
            Value::Object(map) => Ok(map),
            other => {
                let mut map = DataMap::new();
                map.insert("value".to_string(), other);
                Ok(map)
            }
        }
    }

    /// POST JSON；非 2xx 返回 false。
    async fn write_data(&self, device_key: &str, data: &DataMap) -> Result<bool, DriverError> {
        self.base.ensure_running()?;
        let device = self.context.require_device(device_key).await?;
        let url = self.device_url(&device, None);
        let response = self
            .authorize(self.client.post(&url))
            .json(data)
            .send()
            .await
            .map_err(DriverError::transport)?;
        let status = response.status();
        if status.is_success() {
            info!(target: "gw.http", device_key, url = %url, "http_write_succeeded");
            Ok(true)
        } else {
            warn!(target: "gw.http", device_key, url = %url, status = %status, "http_write_rejected");
            Ok(false)
        }
    }

    /// GET `{设备地址}/health`，3 秒超时。
    async fn is_device_online(&self, device_key: &str) -> bool {
        let Ok(device) = self.context.require_device(device_key).await else {
            return false;
        };
        let url = format!("{}/health", self.device_url(&device, None));
        match self
            .authorize(self.client.get(&url))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                debug!(target: "gw.http", device_key, error = %err, "http_health_failed");
                false
            }
        }
    }

    fn config_fields(&self) -> Vec<DriverConfigField> {
        config_fields()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorization_header_by_type() {
        assert_eq!(
            authorization(Some("Bearer"), Some("abc")),
            Some("Bearer abc".to_string())
        );
        assert_eq!(
            authorization(Some("basic"), Some("dXNlcjpwYXNz")),
            Some("Basic dXNlcjpwYXNz".to_string())
        );
        assert_eq!(authorization(Some(""), Some("abc")), None);
        assert_eq!(authorization(Some("Bearer"), None), None);
    }
}
