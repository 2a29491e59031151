//! Modbus TCP 主站
//!
//! - `pool`：按设备复用的连接池（上限、过期清理）
//! - `decode`：按功能码规划批量读取，按映射解码
//! - `write_plan`：连续地址合并写入
//! - `master`：基于 tokio-modbus 的读写

pub mod decode;
pub mod master;
pub mod pool;
pub mod write_plan;

pub use decode::{ReadPlan, decode_bits, decode_registers, plan_reads};
pub use master::{Endpoint, ModbusMaster};
pub use pool::{Acquired, ConnectionPool};
pub use write_plan::{WriteOp, plan_writes};
