use crate::types::RaftNodeInfo;
use anyhow::{Context, Result};
use std::path::Path;

const KEY_CLUSTER_ADDRESS: &[u8] = b"cluster.https_address";
const KEY_SERVER_NAME: &[u8] = b"cluster.server_name";
const KEY_RAFT_NODES: &[u8] = b"raft_nodes";
const KEY_MEMBER_ID: &[u8] = b"member_id";

pub struct LocalStore {
    config_tree: sled::Tree,
    raft_tree: sled::Tree,
    operations_tree: sled::Tree,
}

impl LocalStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path).context("Failed to open local database")?;
        Ok(Self {
            config_tree: db.open_tree("config")?,
            raft_tree: db.open_tree("raft")?,
            operations_tree: db.open_tree("operations")?,
        })
    }

    pub fn cluster_address(&self) -> Result<Option<String>> {
        self.get_config_raw(KEY_CLUSTER_ADDRESS)
    }

    pub fn set_cluster_address(&self, address: &str) -> Result<()> {
        if address.is_empty() {
            self.config_tree.remove(KEY_CLUSTER_ADDRESS)?;
        } else {
            self.config_tree
                .insert(KEY_CLUSTER_ADDRESS, address.as_bytes())?;
        }
        self.config_tree.flush()?;
        Ok(())
    }

    pub fn server_name(&self) -> Result<Option<String>> {
        self.get_config_raw(KEY_SERVER_NAME)
    }

    pub fn set_server_name(&self, name: &str) -> Result<()> {
        self.config_tree.insert(KEY_SERVER_NAME, name.as_bytes())?;
        self.config_tree.flush()?;
        Ok(())
    }

    pub fn member_id(&self) -> Result<Option<u64>> {
        Ok(self
            .config_tree
            .get(KEY_MEMBER_ID)?
            .and_then(|v| v.as_ref().try_into().ok().map(u64::from_be_bytes)))
    }

    pub fn set_member_id(&self, id: u64) -> Result<()> {
        self.config_tree.insert(KEY_MEMBER_ID, &id.to_be_bytes())?;
        self.config_tree.flush()?;
        Ok(())
    }

    fn get_config_raw(&self, key: &[u8]) -> Result<Option<String>> {
        Ok(self
            .config_tree
            .get(key)?
            .map(|v| String::from_utf8_lossy(&v).to_string()))
    }

    pub fn raft_nodes(&self) -> Result<Vec<RaftNodeInfo>> {
        match self.raft_tree.get(KEY_RAFT_NODES)? {
            Some(raw) => Ok(serde_json::from_slice(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    pub fn set_raft_nodes(&self, nodes: &[RaftNodeInfo]) -> Result<()> {
        let raw = serde_json::to_vec(nodes)?;
        self.raft_tree.insert(KEY_RAFT_NODES, raw)?;
        self.raft_tree.flush()?;
        Ok(())
    }

    pub fn put_operation(&self, id: &str, raw: &[u8]) -> Result<()> {
        self.operations_tree.insert(id.as_bytes(), raw)?;
        self.operations_tree.flush()?;
        Ok(())
    }

    pub fn get_operation(&self, id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.operations_tree.get(id.as_bytes())?.map(|v| v.to_vec()))
    }

    pub fn operations(&self) -> Result<Vec<Vec<u8>>> {
        let mut out = Vec::new();
        for item in self.operations_tree.iter() {
            let (_, value) = item?;
            out.push(value.to_vec());
        }
        Ok(out)
    }

    pub fn remove_operation(&self, id: &str) -> Result<()> {
        self.operations_tree.remove(id.as_bytes())?;
        self.operations_tree.flush()?;
        Ok(())
    }

    pub fn wipe_cluster_state(&self) -> Result<()> {
        self.raft_tree.clear()?;
        self.raft_tree.flush()?;
        Ok(())
    }
}
