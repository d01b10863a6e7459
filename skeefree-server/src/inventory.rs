//! Inventory service clients: the site/host inventory (which host lives
//! where, which shards a cluster has) and the MySQL fleet inventory
//! (cluster RW/RO endpoints, port, Vitess flag).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use reqwest::Client;
use tokio::sync::RwLock;

use skeefree_core::{Instance, MySQLCluster};

const HTTP_TIMEOUT: Duration = Duration::from_secs(1);
const CLUSTER_CACHE_TTL: Duration = Duration::from_secs(3600);

fn inventory_http_client() -> Result<Client> {
    Client::builder()
        .connect_timeout(HTTP_TIMEOUT)
        .timeout(HTTP_TIMEOUT)
        .build()
        .context("Failed to build inventory HTTP client")
}

/// Site/host inventory. Each host has general properties (such as `site`)
/// and attributes; of those we are interested in `mysql_cluster` and
/// `mysql_shard`.
#[derive(Clone)]
pub struct SitesApi {
    client: Client,
    url: String,
    password: String,
}

impl SitesApi {
    pub fn new(url: &str, password: &str) -> Result<Self> {
        Ok(Self {
            client: inventory_http_client()?,
            url: url.trim_end_matches('/').to_string(),
            password: password.to_string(),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}/{}", self.url, path);
        let response = self
            .client
            .get(&url)
            .basic_auth("x", Some(&self.password))
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("GET {} returned {}", url, status));
        }
        response
            .json::<T>()
            .await
            .with_context(|| format!("GET {}: failed to decode response", url))
    }

    pub async fn get_instance(&self, hostname: &str) -> Result<Instance> {
        self.get_json(&format!("instances/{}", hostname)).await
    }

    async fn cluster_instances(&self, mysql_cluster: &str) -> Result<Vec<Instance>> {
        let instances: Vec<Instance> = self
            .get_json(&format!("instances?mysql_cluster={}", mysql_cluster))
            .await?;
        if instances.is_empty() {
            return Err(anyhow!("no instances found for mysql_cluster={}", mysql_cluster));
        }
        Ok(instances)
    }

    /// The set of shard names for the given cluster. An unsharded cluster
    /// yields `[""]`.
    pub async fn mysql_cluster_shards(&self, mysql_cluster: &str) -> Result<Vec<String>> {
        let instances = self.cluster_instances(mysql_cluster).await?;
        let shards: HashSet<String> = instances
            .into_iter()
            .map(|instance| instance.attributes.mysql_shard)
            .collect();
        Ok(shards.into_iter().collect())
    }
}

/// MySQL fleet inventory: find a cluster by name along with its RW and RO
/// DNS names, listening port, and whether it is behind Vitess.
#[derive(Clone)]
pub struct MySQLDiscoveryApi {
    client: Client,
    url: String,
    /// Cluster cache: cluster name -> (cluster, fetched-at).
    clusters: Arc<RwLock<HashMap<String, (MySQLCluster, Instant)>>>,
}

impl MySQLDiscoveryApi {
    pub fn new(url: &str) -> Result<Self> {
        Ok(Self {
            client: inventory_http_client()?,
            url: url.trim_end_matches('/').to_string(),
            clusters: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub async fn get_cluster(&self, cluster_name: &str) -> Result<MySQLCluster> {
        {
            let cache = self.clusters.read().await;
            if let Some((cluster, fetched_at)) = cache.get(cluster_name) {
                if fetched_at.elapsed() < CLUSTER_CACHE_TTL {
                    return Ok(cluster.clone());
                }
            }
        }

        let url = format!("{}/cluster/{}", self.url, cluster_name);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("GET {} returned {}", url, status));
        }
        let cluster: MySQLCluster = response
            .json()
            .await
            .with_context(|| format!("GET {}: failed to decode response", url))?;

        let mut cache = self.clusters.write().await;
        cache.insert(cluster_name.to_string(), (cluster.clone(), Instant::now()));
        Ok(cluster)
    }
}
