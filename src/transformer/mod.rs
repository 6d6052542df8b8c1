//! Coordinate transformer interface.
//!
//! The conversion itself is opaque to the server. A session asks its
//! [`TransformerFactory`] for a [`Transformer`] and owns that instance for
//! its whole lifetime, so no transformer state is ever shared between
//! connections.
//!
//! ## Implementations
//! - `process`: drives a long-running helper program over stdin/stdout

mod process;

pub use process::ProcessTransformer;

use std::io;

/// A converted coordinate pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// Converts heliographic coordinates at an observation time into
/// helioprojective coordinates.
///
/// Calls are synchronous and may block; the session runs them on the
/// blocking thread pool.
pub trait Transformer: Send + 'static {
    fn convert(&mut self, lat: f64, lon: f64, obstime: &str) -> Result<Point, TransformError>;
}

/// Produces one transformer per session.
pub trait TransformerFactory: Send + Sync + 'static {
    fn create(&self) -> Box<dyn Transformer>;
}

impl<F> TransformerFactory for F
where
    F: Fn() -> Box<dyn Transformer> + Send + Sync + 'static,
{
    fn create(&self) -> Box<dyn Transformer> {
        self()
    }
}

/// Transformer failures
#[derive(Debug)]
pub enum TransformError {
    /// Helper program could not be started
    Spawn(String, io::Error),
    /// I/O with the helper failed
    Io(io::Error),
    /// Helper exited before answering
    Exited,
    /// Helper answered with something that is not a point
    InvalidOutput(String),
    /// Transformer rejected the input or failed internally
    Failed(String),
}

impl TransformError {
    /// Whether the transformer that produced this error can no longer be used.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransformError::Spawn(..) | TransformError::Io(_) | TransformError::Exited
        )
    }
}

impl std::fmt::Display for TransformError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransformError::Spawn(command, e) => {
                write!(f, "Failed to start transformer '{command}': {e}")
            }
            TransformError::Io(e) => write!(f, "Transformer I/O error: {e}"),
            TransformError::Exited => write!(f, "Transformer exited unexpectedly"),
            TransformError::InvalidOutput(line) => {
                write!(f, "Transformer returned invalid output: {line:?}")
            }
            TransformError::Failed(msg) => write!(f, "Transformer failed: {msg}"),
        }
    }
}

impl std::error::Error for TransformError {}

impl From<io::Error> for TransformError {
    fn from(e: io::Error) -> Self {
        TransformError::Io(e)
    }
}
