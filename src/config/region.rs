use super::ProductionConfig;
use serde::Serialize;
use std::env;
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionRole {
    Primary,
    Secondary,
    Global,
}

/// One regional deployment of the identity provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RegionDescriptor {
    pub region_id: String,
    pub user_pool_id: String,
    /// Identity-provider endpoint id (app client id); empty when unconfigured.
    pub client_id: String,
    pub description: String,
    pub role: RegionRole,
}

impl RegionDescriptor {
    /// A region missing either id is skipped by the prober, never failed.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        !self.user_pool_id.is_empty() && !self.client_id.is_empty()
    }
}

/// `(region id, env suffix, description, role)`
pub const REGION_TABLE: [(&str, &str, &str, RegionRole); 4] = [
    ("ap-northeast-1", "TOKYO", "Tokyo (primary)", RegionRole::Primary),
    ("ap-northeast-3", "OSAKA", "Osaka (secondary)", RegionRole::Secondary),
    ("us-east-1", "VIRGINIA", "N. Virginia (global)", RegionRole::Global),
    ("eu-west-1", "IRELAND", "Ireland (europe)", RegionRole::Global),
];

/// Load the regional deployments from `VIGIL_USER_POOL_ID_<SUFFIX>` and
/// `VIGIL_CLIENT_ID_<SUFFIX>`. The primary and secondary regions fall back to
/// the default configuration; the others stay unconfigured when unset.
#[must_use]
pub fn load_regions(config: &ProductionConfig) -> Vec<RegionDescriptor> {
    REGION_TABLE
        .iter()
        .map(|(region_id, suffix, description, role)| {
            let fallback = |value: &str| match role {
                RegionRole::Primary | RegionRole::Secondary => value.to_string(),
                RegionRole::Global => String::new(),
            };
            let user_pool_id = env_value(&format!("VIGIL_USER_POOL_ID_{suffix}"))
                .unwrap_or_else(|| fallback(&config.user_pool_id));
            let client_id = env_value(&format!("VIGIL_CLIENT_ID_{suffix}"))
                .unwrap_or_else(|| fallback(&config.client_id));

            let descriptor = RegionDescriptor {
                region_id: (*region_id).to_string(),
                user_pool_id,
                client_id,
                description: (*description).to_string(),
                role: *role,
            };

            if !descriptor.is_configured() {
                debug!("region {} is not configured", descriptor.region_id);
            }

            descriptor
        })
        .collect()
}

fn env_value(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGION_VARS: [&str; 8] = [
        "VIGIL_USER_POOL_ID_TOKYO",
        "VIGIL_CLIENT_ID_TOKYO",
        "VIGIL_USER_POOL_ID_OSAKA",
        "VIGIL_CLIENT_ID_OSAKA",
        "VIGIL_USER_POOL_ID_VIRGINIA",
        "VIGIL_CLIENT_ID_VIRGINIA",
        "VIGIL_USER_POOL_ID_IRELAND",
        "VIGIL_CLIENT_ID_IRELAND",
    ];

    fn config() -> ProductionConfig {
        ProductionConfig::new("ap-northeast-1", "pool-default", "client-default", "sessions")
    }

    #[test]
    fn test_fallback_to_default_region() {
        let unset: Vec<(&str, Option<&str>)> = REGION_VARS.iter().map(|k| (*k, None)).collect();
        temp_env::with_vars(unset, || {
            let regions = load_regions(&config());
            assert_eq!(regions.len(), 4);

            assert_eq!(regions[0].region_id, "ap-northeast-1");
            assert_eq!(regions[0].client_id, "client-default");
            assert_eq!(regions[1].user_pool_id, "pool-default");
            assert!(regions[1].is_configured());

            assert!(!regions[2].is_configured());
            assert!(!regions[3].is_configured());
        });
    }

    #[test]
    fn test_regional_overrides() {
        temp_env::with_vars(
            [
                ("VIGIL_USER_POOL_ID_OSAKA", Some("pool-osaka")),
                ("VIGIL_CLIENT_ID_OSAKA", Some("client-osaka")),
                ("VIGIL_USER_POOL_ID_VIRGINIA", Some("pool-virginia")),
                ("VIGIL_CLIENT_ID_VIRGINIA", Some("client-virginia")),
                ("VIGIL_USER_POOL_ID_IRELAND", Some("pool-ireland")),
                ("VIGIL_CLIENT_ID_IRELAND", None),
            ],
            || {
                let regions = load_regions(&config());
                assert_eq!(regions[1].client_id, "client-osaka");
                assert_eq!(regions[1].role, RegionRole::Secondary);
                assert!(regions[2].is_configured());
                assert_eq!(regions[2].client_id, "client-virginia");
                // Half-configured region stays unconfigured
                assert!(!regions[3].is_configured());
            },
        );
    }

    #[test]
    fn test_blank_value_is_unset() {
        temp_env::with_vars([("VIGIL_CLIENT_ID_TOKYO", Some("  "))], || {
            let regions = load_regions(&config());
            assert_eq!(regions[0].client_id, "client-default");
        });
    }
}
