//! ports - 抽象 trait 层
//!
//! 定义宿主消息框架要求的按频道发布/订阅接口

mod close;
mod message_broker;

pub use close::*;
pub use message_broker::*;
