use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Business-level retry schedule. Delay for an attempt is
/// base_delay × 2^(attempts already consumed), capped at max_delay,
/// plus a deterministic jitter in [0, jitter_max].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    pub max_retry_attempts: u32,
    pub base_delay_minutes: i64,
    pub max_delay_minutes: i64,
    pub jitter_max_minutes: i64,
    /// Transport-level attempts per processor/notifier call. Distinct
    /// from the business schedule above.
    pub transport_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DunningPolicyConfig {
    /// A failure qualifies for automatic campaign creation once this
    /// many retry attempts have been consumed.
    pub campaign_trigger_retry_count: u32,
    /// Template used for automatically created campaigns. None disables
    /// auto-creation entirely.
    pub auto_create_campaign_type: Option<String>,
    /// Reschedule delay for a step whose dispatch exhausted the
    /// notification transport.
    pub communication_retry_minutes: i64,
}

/// When does a restricted account become suspended. Evaluated fresh on
/// every recalculation, never applied as a delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum SuspensionPolicy {
    /// The linked dunning campaign ran out of steps without resolution.
    CampaignExhausted,
    /// The customer has accumulated this many unresolved failures.
    FailureCountAtLeast { count: u32 },
    /// The oldest unresolved failure is older than this many days.
    OpenFailureOlderThanDays { days: i64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountPolicyConfig {
    /// Age an unresolved failure must reach before the account enters
    /// the grace period.
    pub grace_threshold_hours: i64,
    /// Length of the grace period before restrictions apply.
    pub grace_period_days: i64,
    /// Every feature the platform knows about. allowed_features is this
    /// list minus the active restrictions.
    pub master_features: Vec<String>,
    /// Features disabled while the account is restricted. A suspended
    /// account loses the full master list.
    pub restricted_features: Vec<String>,
    pub suspension: SuspensionPolicy,
}

/// Immutable dunning sequence definition for one campaign type.
/// Step offsets are hours from campaign start; one entry per step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignTemplate {
    pub campaign_type: String,
    pub total_steps: u32,
    pub step_offset_hours: Vec<i64>,
    pub default_channels: Vec<String>,
    pub ab_test_groups: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RetryPolicyFile {
    retry: RetryPolicyConfig,
    dunning: DunningPolicyConfig,
}

#[derive(Debug, Clone, Deserialize)]
struct CampaignTemplatesFile {
    templates: Vec<CampaignTemplate>,
}

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub retry: RetryPolicyConfig,
    pub dunning: DunningPolicyConfig,
    pub account: AccountPolicyConfig,
    pub campaign_templates: HashMap<String, CampaignTemplate>,
}

impl RecoveryConfig {
    /// Load from the data/ directory.
    /// In tests, use RecoveryConfig::default_test().
    pub fn load(data_dir: &str) -> anyhow::Result<Self> {
        let path = format!("{data_dir}/recovery/retry_policy.json");
        let content = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let policy_file: RetryPolicyFile = serde_json::from_str(&content)?;

        let account_path = format!("{data_dir}/account/access_policy.json");
        let account_content = std::fs::read_to_string(&account_path)
            .map_err(|e| anyhow::anyhow!("Cannot read {account_path}: {e}"))?;
        let account: AccountPolicyConfig = serde_json::from_str(&account_content)?;

        let templates_path = format!("{data_dir}/campaigns/campaign_templates.json");
        let templates_content = std::fs::read_to_string(&templates_path)
            .map_err(|e| anyhow::anyhow!("Cannot read {templates_path}: {e}"))?;
        let templates_file: CampaignTemplatesFile = serde_json::from_str(&templates_content)?;
        let campaign_templates = templates_file
            .templates
            .into_iter()
            .map(|t| (t.campaign_type.clone(), t))
            .collect();

        let config = Self {
            retry: policy_file.retry,
            dunning: policy_file.dunning,
            account,
            campaign_templates,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.retry.max_retry_attempts == 0 {
            anyhow::bail!("max_retry_attempts must be at least 1");
        }
        if self.retry.base_delay_minutes <= 0 {
            anyhow::bail!("base_delay_minutes must be positive");
        }
        for template in self.campaign_templates.values() {
            if template.total_steps == 0 {
                anyhow::bail!(
                    "campaign template '{}' has zero steps",
                    template.campaign_type
                );
            }
            if template.step_offset_hours.len() != template.total_steps as usize {
                anyhow::bail!(
                    "campaign template '{}': {} step offsets for {} steps",
                    template.campaign_type,
                    template.step_offset_hours.len(),
                    template.total_steps
                );
            }
            if template.default_channels.is_empty() {
                anyhow::bail!(
                    "campaign template '{}' has no default channels",
                    template.campaign_type
                );
            }
            if template.ab_test_groups.is_empty() {
                anyhow::bail!(
                    "campaign template '{}' has no A/B groups",
                    template.campaign_type
                );
            }
        }
        if let Some(ref campaign_type) = self.dunning.auto_create_campaign_type {
            if !self.campaign_templates.contains_key(campaign_type) {
                anyhow::bail!("auto_create_campaign_type '{campaign_type}' has no template");
            }
        }
        Ok(())
    }

    /// Config with hardcoded defaults for use in tests.
    pub fn default_test() -> Self {
        let standard = CampaignTemplate {
            campaign_type: "standard".into(),
            total_steps: 5,
            step_offset_hours: vec![0, 72, 168, 336, 504],
            default_channels: vec!["email".into()],
            ab_test_groups: vec!["control".into(), "variant_a".into()],
        };
        let aggressive = CampaignTemplate {
            campaign_type: "aggressive".into(),
            total_steps: 3,
            step_offset_hours: vec![0, 48, 120],
            default_channels: vec!["email".into(), "sms".into()],
            ab_test_groups: vec!["control".into()],
        };

        Self {
            retry: RetryPolicyConfig {
                max_retry_attempts: 3,
                base_delay_minutes: 60,
                max_delay_minutes: 4320,
                jitter_max_minutes: 15,
                transport_attempts: 3,
            },
            dunning: DunningPolicyConfig {
                campaign_trigger_retry_count: 1,
                auto_create_campaign_type: Some("standard".into()),
                communication_retry_minutes: 30,
            },
            account: AccountPolicyConfig {
                grace_threshold_hours: 24,
                grace_period_days: 7,
                master_features: vec![
                    "create_records".into(),
                    "api_access".into(),
                    "exports".into(),
                    "integrations".into(),
                    "billing_portal".into(),
                    "support".into(),
                ],
                restricted_features: vec![
                    "create_records".into(),
                    "api_access".into(),
                    "exports".into(),
                ],
                suspension: SuspensionPolicy::CampaignExhausted,
            },
            campaign_templates: [
                ("standard".to_string(), standard),
                ("aggressive".to_string(), aggressive),
            ]
            .into(),
        }
    }
}
