//! Queries and commands against the external audio/MIDI graph daemon.

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::{error::DirectoryError, port::PortRef};

pub mod jack;
pub mod memory;

pub use jack::JackPortDirectory;
pub use memory::MemoryPortDirectory;

#[async_trait]
pub trait PortDirectoryType: Send + Sync {
    /// Every port the daemon currently knows about.
    async fn list_ports(&self) -> Result<BTreeSet<PortRef>, DirectoryError>;

    /// Ports `port` is currently connected to.
    async fn list_connections(&self, port: &PortRef) -> Result<BTreeSet<PortRef>, DirectoryError>;

    async fn connect(&self, src: &PortRef, dst: &PortRef) -> Result<(), DirectoryError>;

    async fn disconnect(&self, src: &PortRef, dst: &PortRef) -> Result<(), DirectoryError>;

    /// Cheap reachability check used before a chain starts.
    async fn probe(&self) -> Result<(), DirectoryError> {
        self.list_ports().await.map(|_| ())
    }

    fn clone_box(&self) -> Box<dyn PortDirectoryType>;
    fn debug_box(&self) -> String;
}

pub struct PortDirectory(pub Box<dyn PortDirectoryType>);

impl PortDirectory {
    pub async fn list_ports(&self) -> Result<BTreeSet<PortRef>, DirectoryError> {
        self.0.list_ports().await
    }

    pub async fn list_connections(&self, port: &PortRef) -> Result<BTreeSet<PortRef>, DirectoryError> {
        self.0.list_connections(port).await
    }

    pub async fn connect(&self, src: &PortRef, dst: &PortRef) -> Result<(), DirectoryError> {
        self.0.connect(src, dst).await
    }

    pub async fn disconnect(&self, src: &PortRef, dst: &PortRef) -> Result<(), DirectoryError> {
        self.0.disconnect(src, dst).await
    }

    pub async fn probe(&self) -> Result<(), DirectoryError> {
        self.0.probe().await
    }
}

impl Clone for PortDirectory {
    fn clone(&self) -> Self {
        PortDirectory(self.0.clone_box())
    }
}

impl std::fmt::Debug for PortDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}
