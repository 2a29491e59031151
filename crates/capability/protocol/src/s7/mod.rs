//! 西门子 S7（ISO-on-TCP）客户端
//!
//! - `frame`：TPKT/COTP/S7 报文
//! - `address`：`DB1.DBW100` 等地址解析
//! - `data_util`：大端字节布局
//! - `client`：按设备管理连接与读写
//! - `poller`：定时采集与离线判定

pub mod address;
pub mod client;
pub mod data_util;
pub mod frame;
pub mod poller;

pub use address::{S7Address, S7Area, S7Width};
pub use client::{S7Client, S7Endpoint};
pub use poller::{FailureTracker, S7Poller, Transition};
