//! Startup provisioning of RBAC reference data
//!
//! Departments and roles named in the policy configuration are created
//! idempotently before the server accepts traffic. Users are not seeded;
//! they appear on their first successful identity-provider callback.

use crate::config::RbacConfig;
use crate::error::Result;
use crate::store::MetadataStore;
use std::collections::BTreeSet;
use tracing::info;

pub async fn seed_initial_data(store: &MetadataStore, rbac: &RbacConfig) -> Result<()> {
    let mut departments: BTreeSet<&str> =
        rbac.departments.iter().map(String::as_str).collect();
    departments.extend(rbac.roles.keys().map(String::as_str));

    for department in &departments {
        store.create_department(department).await?;
    }

    let mut role_count = 0usize;
    for (department, roles) in &rbac.roles {
        for role in roles {
            store.create_role(role, department).await?;
            role_count += 1;
        }
    }

    info!(
        departments = departments.len(),
        roles = role_count,
        "seeded RBAC reference data"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MetadataStoreConfig, TenantConfig};
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_seed_is_idempotent() {
        let store = MetadataStore::connect(
            &MetadataStoreConfig {
                database_url: "sqlite::memory:".to_string(),
                ..MetadataStoreConfig::default()
            },
            &TenantConfig::default(),
        )
        .await
        .unwrap();

        let rbac = RbacConfig {
            departments: vec!["engineering".to_string(), "finance".to_string()],
            roles: HashMap::from([
                (
                    "engineering".to_string(),
                    vec!["engineer".to_string(), "manager".to_string()],
                ),
                ("finance".to_string(), vec!["analyst".to_string()]),
            ]),
            ..RbacConfig::default()
        };

        seed_initial_data(&store, &rbac).await.unwrap();
        seed_initial_data(&store, &rbac).await.unwrap();

        assert_eq!(store.list_departments().await.unwrap().len(), 2);
        assert_eq!(store.list_roles().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_roles_imply_their_department() {
        let store = MetadataStore::connect(
            &MetadataStoreConfig {
                database_url: "sqlite::memory:".to_string(),
                ..MetadataStoreConfig::default()
            },
            &TenantConfig::default(),
        )
        .await
        .unwrap();

        // Department appears only as a roles key
        let rbac = RbacConfig {
            departments: Vec::new(),
            roles: HashMap::from([("hr".to_string(), vec!["generalist".to_string()])]),
            ..RbacConfig::default()
        };
        seed_initial_data(&store, &rbac).await.unwrap();
        assert!(store
            .department_id_by_name("hr")
            .await
            .unwrap()
            .is_some());
    }
}
