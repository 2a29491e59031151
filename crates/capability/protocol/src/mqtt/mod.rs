//! MQTT 3.1/3.1.1 设备接入端点（TCP 与 WebSocket）。

pub mod broker;
pub mod packet;
pub mod session;
pub mod websocket;

pub use broker::{BrokerConfig, MqttBroker, idle_timeout};
pub use packet::{Connect, MqttCodec, Packet, Publish, connack};
pub use session::{Outbound, SessionManager};
