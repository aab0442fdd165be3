//! Container engine client.
//!
//! Wraps the bollard API with connection fallback (Docker first, then
//! Podman sockets) and the swarm service operations the scheduler needs.

use crate::scheduler::{Result, SchedulerError};
use bollard::models::{Service, ServiceSpec, TaskState};
use bollard::Docker;
use std::sync::Arc;
use tracing::{debug, info};

/// Connection to the container engine, scoped to swarm service operations.
#[derive(Clone)]
pub struct DockerClient {
    docker: Arc<Docker>,
}

impl DockerClient {
    /// Connect to the engine, verifying the connection with a ping.
    pub async fn connect() -> Result<Self> {
        let docker = Self::try_connect().await?;
        let client = Self {
            docker: Arc::new(docker),
        };
        client.ping().await?;
        Ok(client)
    }

    /// Wrap an existing bollard handle (used by tests).
    pub fn from_docker(docker: Docker) -> Self {
        Self {
            docker: Arc::new(docker),
        }
    }

    /// Try local defaults first, then Podman sockets.
    async fn try_connect() -> Result<Docker> {
        debug!("connecting to container engine");
        match Docker::connect_with_local_defaults() {
            Ok(docker) => {
                info!("connected to container engine via local defaults");
                return Ok(docker);
            }
            Err(err) => debug!("local defaults failed: {err}"),
        }

        #[cfg(unix)]
        {
            if let Ok(home) = std::env::var("HOME") {
                let socket = format!("unix://{home}/run/podman/podman.sock");
                match Docker::connect_with_socket(&socket, 120, bollard::API_DEFAULT_VERSION) {
                    Ok(docker) => {
                        info!("connected to Podman via rootless socket");
                        return Ok(docker);
                    }
                    Err(err) => debug!("rootless Podman socket failed: {err}"),
                }
            }
            let socket = "unix:///run/podman/podman.sock";
            match Docker::connect_with_socket(socket, 120, bollard::API_DEFAULT_VERSION) {
                Ok(docker) => {
                    info!("connected to Podman via system socket");
                    return Ok(docker);
                }
                Err(err) => debug!("system Podman socket failed: {err}"),
            }
        }

        Err(SchedulerError::EngineUnavailable(
            "no reachable Docker or Podman daemon".to_string(),
        ))
    }

    pub async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map_err(|err| SchedulerError::EngineUnavailable(err.to_string()))?;
        Ok(())
    }

    /// Create a swarm service from a finished spec.
    pub async fn create_service(&self, spec: ServiceSpec) -> Result<()> {
        let name = spec.name.clone().unwrap_or_default();
        self.docker.create_service(spec, None).await?;
        info!(service = %name, "created service");
        Ok(())
    }

    /// Remove a service by name or id. Already-gone services are not an
    /// error.
    pub async fn remove_service(&self, name_or_id: &str) -> Result<()> {
        match self.docker.delete_service(name_or_id).await {
            Ok(()) => {
                debug!(service = name_or_id, "removed service");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// List services whose names start with the given prefix.
    pub async fn list_services_with_prefix(&self, prefix: &str) -> Result<Vec<Service>> {
        let services = self
            .docker
            .list_services(None::<bollard::query_parameters::ListServicesOptions>)
            .await?;
        Ok(services
            .into_iter()
            .filter(|service| {
                service
                    .spec
                    .as_ref()
                    .and_then(|spec| spec.name.as_deref())
                    .map(|name| name.starts_with(prefix))
                    .unwrap_or(false)
            })
            .collect())
    }

    /// Current task states for one service.
    pub async fn service_task_states(&self, service_id: &str) -> Result<Vec<TaskState>> {
        let tasks = self
            .docker
            .list_tasks(None::<bollard::query_parameters::ListTasksOptions>)
            .await?;
        Ok(tasks
            .into_iter()
            .filter(|task| task.service_id.as_deref() == Some(service_id))
            .filter_map(|task| task.status.and_then(|status| status.state))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires a running Docker/Podman daemon in swarm mode
    async fn test_connect_and_list() {
        let client = DockerClient::connect().await.unwrap();
        client.ping().await.unwrap();
        let services = client.list_services_with_prefix("maas-worker").await.unwrap();
        println!("found {} services", services.len());
    }
}
