//! Audio backend abstraction
//!
//! A [`PortSink`] owns the MIDI output ports, one per attached keyboard.
//! [`JackSink`] is the production implementation; its realtime callback
//! drains the dispatch channel into the port buffers.

pub mod jack_sink;

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::error::{Error, Result};

pub use jack_sink::JackSink;

/// Number of numbered fallbacks tried after the bare port name
pub const PORT_SUFFIX_LIMIT: u32 = 128;

/// Sink-local port handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PortId(pub u32);

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A registered output port
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortHandle {
    pub id: PortId,
    /// Short name as requested
    pub name: String,
    /// Fully qualified name (`client:port`)
    pub full_name: String,
}

/// Backend parameters shown in status reports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SinkInfo {
    pub buffer_size: u32,
    pub sample_rate: u32,
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("port name \"{0}\" already in use")]
    NameTaken(String),

    #[error("unknown port {0}")]
    UnknownPort(PortId),

    #[error("failed to connect {port} to {target}: {message}")]
    Connect {
        port: String,
        target: String,
        message: String,
    },

    #[error("audio backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait PortSink: Send + Sync {
    /// Register a MIDI output port; [`SinkError::NameTaken`] on collision
    async fn register_output_port(&self, name: &str) -> std::result::Result<PortHandle, SinkError>;

    /// Remove a port once nothing can be written to it anymore
    async fn unregister_port(&self, port: PortId) -> std::result::Result<(), SinkError>;

    /// Connect an output port to another client's input port
    async fn connect(&self, port: &PortHandle, target: &str) -> std::result::Result<(), SinkError>;

    fn info(&self) -> SinkInfo {
        SinkInfo::default()
    }
}

/// Register `base`, or the first free `base_0`..`base_127`
///
/// Running out of candidates is fatal ([`Error::PortNameExhausted`]); a name
/// is never shared between two devices.
pub async fn register_unique_port(sink: &dyn PortSink, base: &str) -> Result<PortHandle> {
    let candidates = std::iter::once(base.to_string())
        .chain((0..PORT_SUFFIX_LIMIT).map(|i| format!("{}_{}", base, i)));

    for candidate in candidates {
        match sink.register_output_port(&candidate).await {
            Ok(handle) => return Ok(handle),
            Err(SinkError::NameTaken(name)) => debug!("Port name \"{}\" taken, trying next", name),
            Err(e) => return Err(e.into()),
        }
    }
    Err(Error::PortNameExhausted(base.to_string()))
}


#[cfg(test)]
mod tests {
    use super::testing::MemorySink;
    use super::*;

    #[tokio::test]
    async fn test_free_name_is_used_as_is() {
        let sink = MemorySink::new();
        let port = register_unique_port(&sink, "X").await.unwrap();
        assert_eq!(port.name, "X");
    }

    #[tokio::test]
    async fn test_collision_falls_back_to_first_suffix() {
        let sink = MemorySink::new().with_taken(["X".to_string()]);
        let port = register_unique_port(&sink, "X").await.unwrap();
        assert_eq!(port.name, "X_0");

        let second = register_unique_port(&sink, "X").await.unwrap();
        assert_eq!(second.name, "X_1");
        assert_ne!(port.id, second.id);
    }

    #[tokio::test]
    async fn test_exhausted_names_are_fatal() {
        let taken = std::iter::once("X".to_string()).chain((0..128).map(|i| format!("X_{}", i)));
        let sink = MemorySink::new().with_taken(taken);

        let err = register_unique_port(&sink, "X").await.unwrap_err();
        assert!(matches!(err, Error::PortNameExhausted(ref name) if name == "X"));
        assert!(err.is_fatal());
        assert!(sink.port_names().is_empty());
    }

    #[tokio::test]
    async fn test_unregister_unknown_port() {
        let sink = MemorySink::new();
        let err = sink.unregister_port(PortId(9)).await.unwrap_err();
        assert!(matches!(err, SinkError::UnknownPort(PortId(9))));
    }
}
