use std::collections::HashMap;
use std::sync::LazyLock;

use preagg_error::{DbError, Result, ResultExt};

use crate::mode::ReductionMode;

pub const DEFAULT_TRANSFER_CHUNK_BYTES: usize = 8 << 20;

/// Tunables for one pre-aggregation execution.
#[derive(Debug, Clone, PartialEq)]
pub struct PreAggConfig {
    /// Max number of tasks submitted but not yet completed.
    pub max_inflight_tasks: usize,
    /// Final buffer sizes are rounded up to a multiple of this.
    pub transfer_chunk_bytes: usize,
    /// Fixed number of rows added to every final buffer capacity.
    pub buffer_slack_rows: usize,
    pub stats_trust_tasks: usize,
    pub stats_min_rows: usize,
    pub extra_stats_min_groups: usize,
    pub overflow_growth_factor: usize,
    pub max_oom_retries: usize,
    /// None for automatic selection.
    pub force_reduction_mode: Option<ReductionMode>,
}

impl Default for PreAggConfig {
    fn default() -> Self {
        PreAggConfig {
            max_inflight_tasks: 8,
            transfer_chunk_bytes: DEFAULT_TRANSFER_CHUNK_BYTES,
            buffer_slack_rows: 200,
            stats_trust_tasks: 30,
            stats_min_rows: 1000,
            extra_stats_min_groups: 100,
            overflow_growth_factor: 2,
            max_oom_retries: 64,
            force_reduction_mode: None,
        }
    }
}

impl PreAggConfig {
    pub fn set_from_str(&mut self, name: &str, value: &str) -> Result<()> {
        let func = SETTING_FUNCTIONS
            .get(name)
            .ok_or_else(|| DbError::new(format!("Missing setting for '{name}'")))?;

        (func.set)(value, self)
    }

    pub fn get_as_string(&self, name: &str) -> Result<String> {
        let func = SETTING_FUNCTIONS
            .get(name)
            .ok_or_else(|| DbError::new(format!("Missing setting for '{name}'")))?;

        Ok((func.get)(self))
    }

    /// Parse and apply a `name=value` pair.
    pub fn apply_assignment(&mut self, assignment: &str) -> Result<()> {
        let (name, value) = assignment.split_once('=').ok_or_else(|| {
            DbError::new("Expected setting in the form 'name=value'")
                .with_field("setting", assignment)
        })?;
        self.set_from_str(name.trim(), value.trim())
    }

    pub fn reset(&mut self, name: &str) -> Result<()> {
        let def_conf = Self::default();
        let val = def_conf.get_as_string(name)?;
        self.set_from_str(name, &val)
    }

    /// Names and descriptions of every setting, sorted by name.
    pub fn describe_settings() -> Vec<(&'static str, &'static str)> {
        let mut settings: Vec<_> = SETTING_FUNCTIONS
            .iter()
            .map(|(name, funcs)| (*name, funcs.description))
            .collect();
        settings.sort_unstable_by_key(|(name, _)| *name);
        settings
    }
}

struct SettingFunctions {
    description: &'static str,
    set: fn(value: &str, conf: &mut PreAggConfig) -> Result<()>,
    get: fn(conf: &PreAggConfig) -> String,
}

impl SettingFunctions {
    const fn new<S: PreAggSetting>() -> Self {
        SettingFunctions {
            description: S::DESCRIPTION,
            set: S::set_from_str as _,
            get: S::get_as_string as _,
        }
    }
}

fn insert_setting<S: PreAggSetting>(map: &mut HashMap<&'static str, SettingFunctions>) {
    if map.insert(S::NAME, SettingFunctions::new::<S>()).is_some() {
        panic!("Duplicate settings names: {}", S::NAME);
    }
}

static SETTING_FUNCTIONS: LazyLock<HashMap<&'static str, SettingFunctions>> =
    LazyLock::new(|| {
        let mut map = HashMap::new();

        insert_setting::<MaxInflightTasks>(&mut map);
        insert_setting::<TransferChunkBytes>(&mut map);
        insert_setting::<BufferSlackRows>(&mut map);
        insert_setting::<StatsTrustTasks>(&mut map);
        insert_setting::<StatsMinRows>(&mut map);
        insert_setting::<ExtraStatsMinGroups>(&mut map);
        insert_setting::<OverflowGrowthFactor>(&mut map);
        insert_setting::<MaxOomRetries>(&mut map);
        insert_setting::<ForceReductionMode>(&mut map);

        map
    });

pub trait PreAggSetting: Sync + Send + 'static {
    const NAME: &'static str;
    const DESCRIPTION: &'static str;

    fn set_from_str(value: &str, conf: &mut PreAggConfig) -> Result<()>;
    fn get_as_string(conf: &PreAggConfig) -> String;
}

fn parse_usize(name: &'static str, value: &str) -> Result<usize> {
    value
        .parse::<usize>()
        .context_fn(|| format!("Invalid value for '{name}'"))
}

fn parse_positive(name: &'static str, value: &str) -> Result<usize> {
    let val = parse_usize(name, value)?;
    if val == 0 {
        return Err(DbError::new(format!("'{name}' must be greater than zero")));
    }
    Ok(val)
}

const MIN_INFLIGHT_TASKS: usize = 1;
const MAX_INFLIGHT_TASKS: usize = 1024;

pub struct MaxInflightTasks;

impl MaxInflightTasks {
    pub fn validate_value(val: usize) -> Result<()> {
        if val < MIN_INFLIGHT_TASKS {
            return Err(DbError::new(format!(
                "Inflight task limit cannot be less than {MIN_INFLIGHT_TASKS}"
            )));
        }

        if val > MAX_INFLIGHT_TASKS {
            return Err(DbError::new(format!(
                "Inflight task limit cannot be greater than {MAX_INFLIGHT_TASKS}"
            )));
        }

        Ok(())
    }
}

impl PreAggSetting for MaxInflightTasks {
    const NAME: &'static str = "max_inflight_tasks";
    const DESCRIPTION: &'static str = "Max number of reduction tasks running on the device at once";

    fn set_from_str(value: &str, conf: &mut PreAggConfig) -> Result<()> {
        let val = parse_usize(Self::NAME, value)?;
        Self::validate_value(val)?;
        conf.max_inflight_tasks = val;
        Ok(())
    }

    fn get_as_string(conf: &PreAggConfig) -> String {
        conf.max_inflight_tasks.to_string()
    }
}

pub struct TransferChunkBytes;

impl PreAggSetting for TransferChunkBytes {
    const NAME: &'static str = "transfer_chunk_bytes";
    const DESCRIPTION: &'static str = "Final buffer sizes are rounded up to a multiple of this";

    fn set_from_str(value: &str, conf: &mut PreAggConfig) -> Result<()> {
        conf.transfer_chunk_bytes = parse_positive(Self::NAME, value)?;
        Ok(())
    }

    fn get_as_string(conf: &PreAggConfig) -> String {
        conf.transfer_chunk_bytes.to_string()
    }
}

pub struct BufferSlackRows;

impl PreAggSetting for BufferSlackRows {
    const NAME: &'static str = "buffer_slack_rows";
    const DESCRIPTION: &'static str = "Extra row slots added to every final buffer";

    fn set_from_str(value: &str, conf: &mut PreAggConfig) -> Result<()> {
        conf.buffer_slack_rows = parse_usize(Self::NAME, value)?;
        Ok(())
    }

    fn get_as_string(conf: &PreAggConfig) -> String {
        conf.buffer_slack_rows.to_string()
    }
}

pub struct StatsTrustTasks;

impl PreAggSetting for StatsTrustTasks {
    const NAME: &'static str = "stats_trust_tasks";
    const DESCRIPTION: &'static str =
        "Completed tasks after which run-time statistics fully replace plan estimates";

    fn set_from_str(value: &str, conf: &mut PreAggConfig) -> Result<()> {
        conf.stats_trust_tasks = parse_positive(Self::NAME, value)?;
        Ok(())
    }

    fn get_as_string(conf: &PreAggConfig) -> String {
        conf.stats_trust_tasks.to_string()
    }
}

pub struct StatsMinRows;

impl PreAggSetting for StatsMinRows {
    const NAME: &'static str = "stats_min_rows";
    const DESCRIPTION: &'static str =
        "Observed input rows required before extrapolating the group count";

    fn set_from_str(value: &str, conf: &mut PreAggConfig) -> Result<()> {
        // Extrapolation divides by ln(rows), so at least 2.
        let val = parse_usize(Self::NAME, value)?;
        conf.stats_min_rows = val.max(2);
        Ok(())
    }

    fn get_as_string(conf: &PreAggConfig) -> String {
        conf.stats_min_rows.to_string()
    }
}

pub struct ExtraStatsMinGroups;

impl PreAggSetting for ExtraStatsMinGroups {
    const NAME: &'static str = "extra_stats_min_groups";
    const DESCRIPTION: &'static str =
        "Observed groups required before trusting observed variable-length usage";

    fn set_from_str(value: &str, conf: &mut PreAggConfig) -> Result<()> {
        conf.extra_stats_min_groups = parse_usize(Self::NAME, value)?;
        Ok(())
    }

    fn get_as_string(conf: &PreAggConfig) -> String {
        conf.extra_stats_min_groups.to_string()
    }
}

pub struct OverflowGrowthFactor;

impl PreAggSetting for OverflowGrowthFactor {
    const NAME: &'static str = "overflow_growth_factor";
    const DESCRIPTION: &'static str =
        "Minimum growth of the final buffer row capacity after it overflows";

    fn set_from_str(value: &str, conf: &mut PreAggConfig) -> Result<()> {
        let val = parse_usize(Self::NAME, value)?;
        if val < 2 {
            return Err(DbError::new(format!("'{}' must be at least 2", Self::NAME)));
        }
        conf.overflow_growth_factor = val;
        Ok(())
    }

    fn get_as_string(conf: &PreAggConfig) -> String {
        conf.overflow_growth_factor.to_string()
    }
}

pub struct MaxOomRetries;

impl PreAggSetting for MaxOomRetries {
    const NAME: &'static str = "max_oom_retries";
    const DESCRIPTION: &'static str =
        "Consecutive device memory retries with no running task before giving up";

    fn set_from_str(value: &str, conf: &mut PreAggConfig) -> Result<()> {
        conf.max_oom_retries = parse_usize(Self::NAME, value)?;
        Ok(())
    }

    fn get_as_string(conf: &PreAggConfig) -> String {
        conf.max_oom_retries.to_string()
    }
}

pub struct ForceReductionMode;

impl PreAggSetting for ForceReductionMode {
    const NAME: &'static str = "force_reduction_mode";
    const DESCRIPTION: &'static str =
        "Force a reduction mode (auto, nogroup, local, global, final)";

    fn set_from_str(value: &str, conf: &mut PreAggConfig) -> Result<()> {
        if value.eq_ignore_ascii_case("auto") {
            conf.force_reduction_mode = None;
            return Ok(());
        }

        let mode = ReductionMode::from_name(value).ok_or_else(|| {
            DbError::new("Unknown reduction mode").with_field("mode", value)
        })?;
        conf.force_reduction_mode = Some(mode);
        Ok(())
    }

    fn get_as_string(conf: &PreAggConfig) -> String {
        match conf.force_reduction_mode {
            Some(mode) => mode.as_str().to_ascii_lowercase(),
            None => "auto".to_string(),
        }
    }
}
