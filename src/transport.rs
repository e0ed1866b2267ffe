pub use peercall_tokio_transport::{
    ChannelEvent, ChannelFactory, SignalingChannel, TokioWebSocketChannel,
    TokioWebSocketChannelFactory,
};
