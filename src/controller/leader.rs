//! Leader election
//!
//! Lease-based election over `coordination.k8s.io/v1`. Cluster-scoped
//! collaborators run only while this process holds the lease.

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{ObjectMeta, PostParams};
use kube::{Api, Client};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct LeaderConfig {
    pub lease_name: String,
    pub namespace: String,
    /// Holder identity, the pod name
    pub identity: String,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            lease_name: "hwameistor-local-storage".to_string(),
            namespace: "hwameistor".to_string(),
            identity: String::new(),
            lease_duration: Duration::from_secs(30),
            renew_deadline: Duration::from_secs(25),
            retry_period: Duration::from_secs(15),
        }
    }
}

/// Whether `identity` may take or keep the lease at `now`
pub fn lease_available(spec: Option<&LeaseSpec>, identity: &str, now: DateTime<Utc>) -> bool {
    let Some(spec) = spec else {
        return true;
    };
    match spec.holder_identity.as_deref() {
        None | Some("") => return true,
        Some(holder) if holder == identity => return true,
        Some(_) => {}
    }
    let Some(MicroTime(renewed)) = spec.renew_time.as_ref() else {
        return true;
    };
    let duration = chrono::Duration::seconds(i64::from(spec.lease_duration_seconds.unwrap_or(0)));
    *renewed + duration < now
}

pub struct LeaderElector {
    api: Api<Lease>,
    config: LeaderConfig,
}

impl LeaderElector {
    pub fn new(client: Client, config: LeaderConfig) -> Self {
        Self {
            api: Api::namespaced(client, &config.namespace),
            config,
        }
    }

    fn claimed_spec(&self, previous: Option<&LeaseSpec>, now: DateTime<Utc>) -> LeaseSpec {
        let held = previous.and_then(|s| s.holder_identity.as_deref()) == Some(self.config.identity.as_str());
        let transitions = previous.and_then(|s| s.lease_transitions).unwrap_or(0);
        LeaseSpec {
            holder_identity: Some(self.config.identity.clone()),
            lease_duration_seconds: Some(self.config.lease_duration.as_secs() as i32),
            acquire_time: if held {
                previous.and_then(|s| s.acquire_time.clone())
            } else {
                Some(MicroTime(now))
            },
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(if held { transitions } else { transitions + 1 }),
        }
    }

    /// One acquire-or-renew attempt; true when the lease is held afterwards
    pub async fn try_acquire(&self) -> Result<bool> {
        let now = Utc::now();
        match self.api.get_opt(&self.config.lease_name).await? {
            None => {
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(self.config.lease_name.clone()),
                        namespace: Some(self.config.namespace.clone()),
                        ..Default::default()
                    },
                    spec: Some(self.claimed_spec(None, now)),
                };
                match self.api.create(&PostParams::default(), &lease).await {
                    Ok(_) => Ok(true),
                    Err(kube::Error::Api(resp)) if resp.code == 409 => Ok(false),
                    Err(e) => Err(Error::Kube(e)),
                }
            }
            Some(mut lease) => {
                if !lease_available(lease.spec.as_ref(), &self.config.identity, now) {
                    return Ok(false);
                }
                lease.spec = Some(self.claimed_spec(lease.spec.as_ref(), now));
                match self
                    .api
                    .replace(&self.config.lease_name, &PostParams::default(), &lease)
                    .await
                {
                    Ok(_) => Ok(true),
                    Err(kube::Error::Api(resp)) if resp.code == 409 => Ok(false),
                    Err(e) => Err(Error::Kube(e)),
                }
            }
        }
    }

    /// Run `lead` each time the lease is won; its token is cancelled when
    /// the lease is lost or `token` is cancelled.
    pub async fn run<F, Fut>(&self, token: CancellationToken, lead: F)
    where
        F: Fn(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        info!("Leader election started as {}", self.config.identity);
        while !token.is_cancelled() {
            match self.try_acquire().await {
                Ok(true) => {
                    info!("Acquired lease {}", self.config.lease_name);
                    let child = token.child_token();
                    let task = tokio::spawn(lead(child.clone()));
                    self.hold(&token).await;
                    child.cancel();
                    let _ = task.await;
                    if !token.is_cancelled() {
                        warn!("Lost lease {}", self.config.lease_name);
                    }
                }
                Ok(false) => debug!("Lease {} held by another node", self.config.lease_name),
                Err(e) => warn!("Lease {} acquire failed: {}", self.config.lease_name, e),
            }
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }
        }
        info!("Leader election stopped");
    }

    /// Renew until a renewal misses the deadline or shutdown
    async fn hold(&self, token: &CancellationToken) {
        let mut last_renew = tokio::time::Instant::now();
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }
            match self.try_acquire().await {
                Ok(true) => last_renew = tokio::time::Instant::now(),
                Ok(false) => return,
                Err(e) => {
                    warn!("Lease {} renew failed: {}", self.config.lease_name, e);
                    if last_renew.elapsed() > self.config.renew_deadline {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(holder: &str, renewed: DateTime<Utc>) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(holder.into()),
            lease_duration_seconds: Some(30),
            renew_time: Some(MicroTime(renewed)),
            ..Default::default()
        }
    }

    #[test]
    fn test_lease_available() {
        let now = Utc::now();
        assert!(lease_available(None, "pod-a", now));
        assert!(lease_available(Some(&LeaseSpec::default()), "pod-a", now));
        assert!(lease_available(Some(&spec("pod-a", now)), "pod-a", now));
        assert!(!lease_available(Some(&spec("pod-b", now)), "pod-a", now));

        let stale = now - chrono::Duration::seconds(31);
        assert!(lease_available(Some(&spec("pod-b", stale)), "pod-a", now));
    }
}
