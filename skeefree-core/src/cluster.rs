use serde::{Deserialize, Serialize};

/// A MySQL cluster as described by the fleet inventory service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MySQLCluster {
    #[serde(rename = "cluster_name")]
    pub name: String,
    #[serde(default)]
    pub rw_name: String,
    #[serde(default)]
    pub ro_name: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default, rename = "vitess")]
    pub is_vitess: bool,
}

impl MySQLCluster {
    pub fn named(name: &str) -> MySQLCluster {
        MySQLCluster {
            name: name.to_string(),
            ..Default::default()
        }
    }
}

/// A host as described by the site inventory service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Instance {
    pub hostname: String,
    pub site: String,
    #[serde(default)]
    pub attributes: InstanceAttributes,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceAttributes {
    #[serde(default)]
    pub mysql_cluster: String,
    #[serde(default)]
    pub mysql_role: String,
    #[serde(default)]
    pub mysql_shard: String,
}
