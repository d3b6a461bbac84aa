//! Read-only client for the host's VMM management API.
//!
//! The management daemon exposes domain state over a local unix socket;
//! this client covers the three calls the agent needs: domain lookup,
//! metadata fetch, and enumeration of running domains.

use crate::error::{Result, ServerError};
use http_body_util::BodyExt;
use hyper::body::Bytes;
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::Deserialize;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Fixed management socket of the host VMM daemon.
pub const VMM_API_SOCKET: &str = "/run/guestnet/vmm.sock";

/// Namespace of the network-configuration element in domain metadata.
pub const METADATA_NAMESPACE: &str = "http://guestnet.dev/network/1.0";

/// Domain document returned by the management API.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct DomainInfo {
    pub name: String,
    pub state: String,
}

impl DomainInfo {
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

/// Read-only connection handle to the management socket.
#[derive(Debug)]
pub struct VmmClient {
    socket_path: PathBuf,
    client: Client<hyperlocal::UnixConnector, http_body_util::Empty<Bytes>>,
    open: bool,
}

impl VmmClient {
    /// Open a read-only connection. Fails if the management socket is not
    /// present.
    pub fn connect_read_only(socket_path: impl AsRef<Path>) -> Result<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();
        if !socket_path.exists() {
            return Err(ServerError::Connection(io::Error::new(
                io::ErrorKind::NotFound,
                format!("management socket {} not present", socket_path.display()),
            )));
        }

        let client = Client::builder(TokioExecutor::new()).build(hyperlocal::UnixConnector);
        Ok(VmmClient {
            socket_path,
            client,
            open: true,
        })
    }

    async fn get(&self, endpoint: &str) -> Result<(StatusCode, Bytes)> {
        debug!(endpoint, "management API request");
        let uri = hyperlocal::Uri::new(&self.socket_path, endpoint);
        let req = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(http_body_util::Empty::new())
            .map_err(|e| ServerError::Connection(io::Error::other(e)))?;

        let resp = self
            .client
            .request(req)
            .await
            .map_err(|e| ServerError::Connection(io::Error::other(e)))?;

        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| ServerError::Connection(io::Error::other(e)))?
            .to_bytes();
        Ok((status, body))
    }

    /// Look a domain up by name.
    pub async fn lookup_domain(&self, name: &str) -> Result<DomainInfo> {
        let (status, body) = self.get(&format!("/api/v1/domains/{name}")).await?;
        match status {
            StatusCode::NOT_FOUND => Err(ServerError::Lookup(name.to_string())),
            s if s.is_success() => serde_json::from_slice(&body)
                .map_err(|e| ServerError::Connection(io::Error::other(e))),
            s => Err(ServerError::Connection(io::Error::other(format!(
                "domain lookup returned {s}"
            )))),
        }
    }

    /// Fetch the live metadata element for `namespace`, as a raw document.
    pub async fn domain_metadata(&self, name: &str, namespace: &str) -> Result<String> {
        let (status, body) = self
            .get(&format!(
                "/api/v1/domains/{name}/metadata?ns={namespace}&live=true"
            ))
            .await?;
        match status {
            StatusCode::NOT_FOUND => Err(ServerError::Metadata(format!(
                "domain {name} carries no live metadata for {namespace}"
            ))),
            s if s.is_success() => String::from_utf8(body.to_vec())
                .map_err(|e| ServerError::Metadata(format!("metadata not UTF-8: {e}"))),
            s => Err(ServerError::Connection(io::Error::other(format!(
                "metadata fetch returned {s}"
            )))),
        }
    }

    /// Enumerate all domains known to the VMM.
    pub async fn list_domains(&self) -> Result<Vec<DomainInfo>> {
        let (status, body) = self.get("/api/v1/domains").await?;
        if !status.is_success() {
            return Err(ServerError::Connection(io::Error::other(format!(
                "domain list returned {status}"
            ))));
        }
        serde_json::from_slice(&body).map_err(|e| ServerError::Connection(io::Error::other(e)))
    }

    /// The connection is alive while it has not been released and the
    /// daemon's socket is still present.
    pub fn is_alive(&self) -> bool {
        self.open && self.socket_path.exists()
    }

    /// Release the connection. Idempotent.
    pub fn close(&mut self) {
        self.open = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_fails_without_socket() {
        let err = VmmClient::connect_read_only("/nonexistent/guestnet/vmm.sock").unwrap_err();
        assert!(matches!(err, ServerError::Connection(_)));
    }

    #[test]
    fn domain_running_state() {
        let info: DomainInfo =
            serde_json::from_str(r#"{"name": "vm1", "state": "running"}"#).unwrap();
        assert!(info.is_running());

        let info: DomainInfo =
            serde_json::from_str(r#"{"name": "vm2", "state": "shutoff"}"#).unwrap();
        assert!(!info.is_running());
    }
}
