//! The boundary to the wire codec.
//!
//! This crate manages connections; it does not speak HTTP. A codec
//! implementation binds to an established [`Connection`] (taking its
//! transport with [`Connection::detach_io`] when it needs exclusive
//! ownership) and frames requests and responses over it.

use std::fmt;
use std::sync::Arc;

use crate::conn::Connection;

/// A wire codec bound to one exchange.
pub trait Codec: Send + Sync + fmt::Debug {
    /// Tear down the stream carrying this exchange.
    ///
    /// Multiplexed codecs cancel only their own stream; HTTP/1 codecs
    /// poison the whole connection.
    fn cancel(&self);
}

/// Creates codecs for established connections.
pub trait CodecFactory: Send + Sync + fmt::Debug {
    /// Bind a codec for one exchange over `connection`.
    fn bind(&self, connection: &Arc<Connection>) -> Arc<dyn Codec>;
}
