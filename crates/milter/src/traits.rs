use std::fmt::Debug;
use tokio::io::{AsyncRead, AsyncWrite};

/// A full-duplex byte stream usable as a milter transport.
pub trait AsyncReadAndWrite: AsyncRead + AsyncWrite + Debug + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Debug + Unpin + Send> AsyncReadAndWrite for T {}

pub type BoxedAsyncReadAndWrite = Box<dyn AsyncReadAndWrite>;
