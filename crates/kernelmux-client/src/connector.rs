//! How a client obtains a byte stream to its kernel.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use kernelmux_wire::WireError;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

/// A duplex byte stream carrying framed kernel traffic.
pub trait KernelStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> KernelStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedStream = Box<dyn KernelStream>;

/// Dials a kernel. Called once per connection attempt.
pub trait KernelConnector: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'static, std::result::Result<BoxedStream, WireError>>;

    /// Human-readable target for logs.
    fn describe(&self) -> String;
}

/// Connects over a Unix domain socket.
#[cfg(unix)]
#[derive(Debug, Clone)]
pub struct SocketConnector {
    path: PathBuf,
}

#[cfg(unix)]
impl SocketConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
impl KernelConnector for SocketConnector {
    fn connect(&self) -> BoxFuture<'static, std::result::Result<BoxedStream, WireError>> {
        let path = self.path.clone();
        Box::pin(async move {
            let stream = kernelmux_wire::transport::connect(&path).await?;
            Ok(Box::new(stream) as BoxedStream)
        })
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Produces a connector for a kernel id. Used by the client registry.
pub trait ConnectorFactory: Send + Sync {
    fn connector(&self, kernel_id: &str) -> Result<Arc<dyn KernelConnector>>;
}

impl<F> ConnectorFactory for F
where
    F: Fn(&str) -> Result<Arc<dyn KernelConnector>> + Send + Sync,
{
    fn connector(&self, kernel_id: &str) -> Result<Arc<dyn KernelConnector>> {
        self(kernel_id)
    }
}

/// Resolves kernel ids to sockets named `kernel-<id>.sock` in one directory.
#[cfg(unix)]
#[derive(Debug, Clone)]
pub struct SocketDirConnectorFactory {
    dir: PathBuf,
}

#[cfg(unix)]
impl SocketDirConnectorFactory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn socket_path(&self, kernel_id: &str) -> PathBuf {
        self.dir.join(format!("kernel-{kernel_id}.sock"))
    }
}

#[cfg(unix)]
impl ConnectorFactory for SocketDirConnectorFactory {
    fn connector(&self, kernel_id: &str) -> Result<Arc<dyn KernelConnector>> {
        if kernel_id.is_empty()
            || kernel_id.contains(std::path::is_separator)
            || kernel_id.starts_with('.')
        {
            return Err(crate::ClientError::Config(format!(
                "kernel id '{kernel_id}' cannot be used as a socket name"
            )));
        }
        Ok(Arc::new(SocketConnector::new(self.socket_path(kernel_id))))
    }
}
