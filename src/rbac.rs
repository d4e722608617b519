//! RBAC resolution
//!
//! Translates a user's (department, role) grants into the set of
//! (department, classification) pairs their queries may touch. The access
//! matrix comes from configuration, is parsed once at startup, and never
//! changes at runtime. A user with no grants resolves to the empty set,
//! which callers must treat as deny-all.

use crate::config::RbacConfig;
use crate::error::Result;
use crate::model::{AccessPair, Classification};
use crate::store::MetadataStore;
use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use tracing::warn;
use uuid::Uuid;

/// classification -> department -> allowed roles
#[derive(Debug, Clone, Default)]
pub struct AccessMatrix {
    inner: HashMap<Classification, HashMap<String, Vec<String>>>,
}

impl AccessMatrix {
    /// Parse the configured matrix. Entries under a classification label the
    /// system does not know are dropped: an unreachable label fails closed.
    pub fn from_config(config: &RbacConfig) -> Self {
        let mut inner = HashMap::new();
        for (label, departments) in &config.access_matrix {
            match Classification::from_str(label) {
                Ok(classification) => {
                    inner.insert(classification, departments.clone());
                }
                Err(_) => {
                    warn!(label, "ignoring unknown classification in access matrix");
                }
            }
        }
        Self { inner }
    }

    pub fn allows(&self, classification: Classification, department: &str, role: &str) -> bool {
        self.inner
            .get(&classification)
            .and_then(|departments| departments.get(department))
            .map(|roles| roles.iter().any(|r| r == role))
            .unwrap_or(false)
    }

    pub fn classifications(&self) -> impl Iterator<Item = Classification> + '_ {
        self.inner.keys().copied()
    }
}

pub struct RbacResolver {
    matrix: AccessMatrix,
}

impl RbacResolver {
    pub fn new(config: &RbacConfig) -> Self {
        Self {
            matrix: AccessMatrix::from_config(config),
        }
    }

    /// Compute the deduplicated (department, classification) set for a user.
    /// Pure in the grants and the matrix; repeated calls agree.
    pub fn filters_from_pairs(&self, pairs: &[AccessPair]) -> Vec<(String, Classification)> {
        let mut allowed: BTreeSet<(String, &'static str)> = BTreeSet::new();
        for pair in pairs {
            for classification in self.matrix.classifications() {
                if self
                    .matrix
                    .allows(classification, &pair.department, &pair.role)
                {
                    allowed.insert((pair.department.clone(), classification.as_str()));
                }
            }
        }
        allowed
            .into_iter()
            .filter_map(|(department, label)| {
                Classification::from_str(label)
                    .ok()
                    .map(|classification| (department, classification))
            })
            .collect()
    }

    /// Read the user's grants and resolve them against the matrix
    pub async fn filters_for(
        &self,
        store: &MetadataStore,
        user_id: Uuid,
    ) -> Result<Vec<(String, Classification)>> {
        let pairs = store.get_user_access_pairs(user_id).await?;
        Ok(self.filters_from_pairs(&pairs))
    }
}
