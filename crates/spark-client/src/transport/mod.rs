//! 传输层：建连接口、帧格式、流量控制与多路复用连接。
//!
//! - [`connector`]：把地址变成字节流（[`Connector`]）并完成凭据握手（[`ChannelCredentials`]）；
//! - [`frame`]：线上帧格式，测试桩与传输实现共用；
//! - [`Transport`]：一条字节流上的多路复用连接；
//! - [`ClientStream`]：单个调用在传输上的流。

pub mod connector;
pub mod frame;

mod connection;
mod flow;
mod stream;

pub use connection::{CloseReason, Lifecycle, Transport};
pub use connector::{
    AsyncIo, BoxedIo, ChannelCredentials, ConnectOptions, Connector, InsecureCredentials,
};
pub use stream::ClientStream;
