//! Route registrar backed by the reverse proxy's file provider.
//!
//! Each route is one YAML file in the watched directory. The proxy reloads
//! the directory on change, so no restart is needed.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use provisioning_sdk::{RouteError, RouteKey, RouteRegistrar};
use serde::Serialize;
use tracing::debug;

use crate::config::RoutesConfig;

#[derive(Debug, Serialize)]
struct DynamicConfig {
    http: HttpSection,
}

#[derive(Debug, Serialize)]
struct HttpSection {
    routers: BTreeMap<String, Router>,
    services: BTreeMap<String, Service>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Router {
    rule: String,
    entry_points: Vec<String>,
    service: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tls: Option<Tls>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Tls {
    cert_resolver: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Service {
    load_balancer: LoadBalancer,
}

#[derive(Debug, Serialize)]
struct LoadBalancer {
    servers: Vec<Server>,
}

#[derive(Debug, Serialize)]
struct Server {
    url: String,
}

#[derive(Debug, Clone)]
pub struct FileRouteRegistrar {
    config: RoutesConfig,
}

impl FileRouteRegistrar {
    #[must_use]
    pub fn new(config: RoutesConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn route_path(&self, key: &RouteKey) -> PathBuf {
        self.config.dir.join(format!("{key}.yml"))
    }

    fn render(&self, key: &RouteKey, port: u16) -> Result<String, RouteError> {
        let name = key.to_string();
        let router = Router {
            rule: format!("Host(`{}.{}`)", key.username(), self.config.domain),
            entry_points: self.config.entry_points.clone(),
            service: name.clone(),
            tls: self.config.cert_resolver.clone().map(|cert_resolver| Tls { cert_resolver }),
        };
        let service = Service {
            load_balancer: LoadBalancer {
                servers: vec![Server {
                    url: format!("http://{}:{port}", self.config.backend_host),
                }],
            },
        };

        let doc = DynamicConfig {
            http: HttpSection {
                routers: BTreeMap::from([(name.clone(), router)]),
                services: BTreeMap::from([(name, service)]),
            },
        };
        serde_saphyr::to_string(&doc)
            .map_err(|e| RouteError::permanent(format!("cannot render route {key}: {e}")))
    }
}

#[async_trait]
impl RouteRegistrar for FileRouteRegistrar {
    async fn add_route(&self, key: &RouteKey, port: u16) -> Result<(), RouteError> {
        let body = self.render(key, port)?;
        let path = self.route_path(key);
        let dir = self.config.dir.clone();

        let target = path.clone();
        let written = on_blocking_pool(key, move || write_route(&dir, &target, &body)).await?;
        if written {
            debug!(route = %key, port, path = %path.display(), "route written");
        } else {
            debug!(route = %key, port, "route unchanged");
        }
        Ok(())
    }

    async fn remove_route(&self, key: &RouteKey) -> Result<(), RouteError> {
        let path = self.route_path(key);

        let target = path.clone();
        let removed = on_blocking_pool(key, move || delete_route(&target)).await?;
        if removed {
            debug!(route = %key, path = %path.display(), "route removed");
        }
        Ok(())
    }
}

async fn on_blocking_pool<T, F>(key: &RouteKey, op: F) -> Result<T, RouteError>
where
    T: Send + 'static,
    F: FnOnce() -> io::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| RouteError::transient(format!("route {key}: file task failed: {e}")))?
        .map_err(|e| io_error(key, &e))
}

/// Write `body` unless the file already holds it. Returns whether it wrote.
fn write_route(dir: &Path, path: &Path, body: &str) -> io::Result<bool> {
    if fs::read_to_string(path).is_ok_and(|current| current == body) {
        return Ok(false);
    }
    write_atomic(dir, path, body.as_bytes())?;
    Ok(true)
}

/// Returns whether a file was there to remove.
fn delete_route(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

fn write_atomic(dir: &Path, path: &Path, body: &[u8]) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".route-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    tmp.write_all(body)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn io_error(key: &RouteKey, e: &io::Error) -> RouteError {
    match e.kind() {
        io::ErrorKind::PermissionDenied => RouteError::permanent(format!("route {key}: {e}")),
        _ => RouteError::transient(format!("route {key}: {e}")),
    }
}
