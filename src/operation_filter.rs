//! Operation filtering for API and device activity names
//!
//! Expressions are `;`-separated clauses:
//! - Individual operations: `trace=hipMemcpy,hipLaunchKernel`
//! - Operation classes: `trace=launch`, `trace=memcpy`
//! - Exclusions: `exclude=hipGetDevice,hipSetDevice`
//! - Regular expressions between slashes: `trace=/^hipMemcpy.*Async$/`
//!
//! Exclusions always win over inclusions.

use crate::error::{TraceError, TraceResult};
use regex::Regex;
use std::collections::HashSet;

/// Runtime bookkeeping calls that must never be traced
const HIP_SKIPPED: &[&str] = &[
    "__hipPushCallConfiguration",
    "__hipPopCallConfiguration",
    "hipDeviceEnablePeerAccess",
    "hipImportExternalMemory",
    "hipDestroyExternalMemory",
];

/// Informational HSA queries, far too frequent to be useful spans
const HSA_SKIPPED: &[&str] = &[
    "hsa_init",
    "hsa_shut_down",
    "hsa_agent_get_exception_policies",
    "hsa_agent_get_info",
    "hsa_amd_agent_iterate_memory_pools",
    "hsa_amd_agent_memory_pool_get_info",
    "hsa_amd_coherency_get_type",
    "hsa_amd_memory_pool_get_info",
    "hsa_amd_pointer_info",
    "hsa_amd_pointer_info_set_userdata",
    "hsa_amd_profiling_async_copy_enable",
    "hsa_amd_profiling_get_async_copy_time",
    "hsa_amd_profiling_get_dispatch_time",
    "hsa_amd_profiling_set_profiler_enabled",
    "hsa_cache_get_info",
    "hsa_code_object_get_info",
    "hsa_code_object_get_symbol",
    "hsa_code_object_get_symbol_from_name",
    "hsa_code_object_reader_create_from_memory",
    "hsa_code_symbol_get_info",
    "hsa_executable_create_alt",
    "hsa_executable_freeze",
    "hsa_executable_get_info",
    "hsa_executable_get_symbol",
    "hsa_executable_get_symbol_by_name",
    "hsa_executable_symbol_get_info",
    "hsa_extension_get_name",
    "hsa_ext_image_data_get_info",
    "hsa_ext_image_data_get_info_with_layout",
    "hsa_ext_image_get_capability",
    "hsa_ext_image_get_capability_with_layout",
    "hsa_isa_get_exception_policies",
    "hsa_isa_get_info",
    "hsa_isa_get_info_alt",
    "hsa_isa_get_round_method",
    "hsa_region_get_info",
    "hsa_system_extension_supported",
    "hsa_system_get_extension_table",
    "hsa_system_get_info",
    "hsa_system_get_major_extension_table",
    "hsa_wavefront_get_info",
];

/// Kernel launch entry points; these carry a kernel name in their arguments
pub const LAUNCH_OPERATIONS: &[&str] = &[
    "hipLaunchKernel",
    "hipLaunchCooperativeKernel",
    "hipLaunchCooperativeKernelMultiDevice",
    "hipHccModuleLaunchKernel",
    "hipModuleLaunchKernel",
    "hipExtModuleLaunchKernel",
    "hipExtLaunchKernel",
    "hipExtLaunchMultiKernelMultiDevice",
];

const MEMCPY_OPERATIONS: &[&str] = &[
    "hipMemcpy",
    "hipMemcpyAsync",
    "hipMemcpyDtoD",
    "hipMemcpyDtoDAsync",
    "hipMemcpyDtoH",
    "hipMemcpyDtoHAsync",
    "hipMemcpyHtoD",
    "hipMemcpyHtoDAsync",
    "hipMemcpy2D",
    "hipMemcpy2DAsync",
    "hipMemcpyPeer",
    "hipMemcpyPeerAsync",
    "hipMemset",
    "hipMemsetAsync",
];

const MEMORY_OPERATIONS: &[&str] = &[
    "hipMalloc",
    "hipMallocManaged",
    "hipHostMalloc",
    "hipFree",
    "hipHostFree",
    "hipMallocAsync",
    "hipFreeAsync",
];

/// Decides which operation names are traced
#[derive(Debug, Clone, Default)]
pub struct OperationFilter {
    /// Names to include (None = everything not excluded)
    include: Option<HashSet<String>>,
    include_patterns: Vec<Regex>,
    exclude: HashSet<String>,
    exclude_patterns: Vec<Regex>,
}

impl OperationFilter {
    /// Create a filter that accepts every operation
    pub fn all() -> Self {
        Self::default()
    }

    /// Filter that rejects the runtime bookkeeping and informational query calls
    pub fn default_api_exclusions() -> Self {
        Self {
            exclude: HIP_SKIPPED
                .iter()
                .chain(HSA_SKIPPED)
                .map(|s| s.to_string())
                .collect(),
            ..Self::default()
        }
    }

    /// Parse an expression like `trace=launch;exclude=hipLaunchKernel`
    ///
    /// # Errors
    ///
    /// Returns [`TraceError::InvalidFilter`] on an unknown clause or a bad regex.
    pub fn from_expr(expr: &str) -> TraceResult<Self> {
        let mut filter = Self::default();
        let mut clauses = 0;

        for clause in expr.split(';').map(str::trim).filter(|c| !c.is_empty()) {
            clauses += 1;
            if let Some(list) = clause.strip_prefix("trace=") {
                let include = filter.include.get_or_insert_with(HashSet::new);
                for token in tokens(list) {
                    match parse_pattern(token)? {
                        Some(re) => filter.include_patterns.push(re),
                        None => include.extend(expand_class(token)),
                    }
                }
            } else if let Some(list) = clause.strip_prefix("exclude=") {
                for token in tokens(list) {
                    match parse_pattern(token)? {
                        Some(re) => filter.exclude_patterns.push(re),
                        None => filter.exclude.extend(expand_class(token)),
                    }
                }
            } else {
                return Err(TraceError::InvalidFilter(format!(
                    "{}. Expected trace=SPEC or exclude=SPEC",
                    clause
                )));
            }
        }

        if clauses == 0 {
            return Err(TraceError::InvalidFilter("empty expression".to_string()));
        }
        Ok(filter)
    }

    /// Combine two filters; the result accepts what both accept
    pub fn merge(mut self, other: OperationFilter) -> Self {
        self.include = match (self.include.take(), other.include) {
            (None, None) => None,
            (Some(a), None) | (None, Some(a)) => Some(a),
            (Some(a), Some(b)) => Some(a.intersection(&b).cloned().collect()),
        };
        self.include_patterns.extend(other.include_patterns);
        self.exclude.extend(other.exclude);
        self.exclude_patterns.extend(other.exclude_patterns);
        self
    }

    /// Check if an operation should be traced
    pub fn should_trace(&self, name: &str) -> bool {
        if self.exclude.contains(name) || self.exclude_patterns.iter().any(|re| re.is_match(name))
        {
            return false;
        }

        let listed = self.include.as_ref().map(|set| set.contains(name));
        let matched = if self.include_patterns.is_empty() {
            None
        } else {
            Some(self.include_patterns.iter().any(|re| re.is_match(name)))
        };

        match (listed, matched) {
            (None, None) => true,
            (Some(l), None) => l,
            (None, Some(m)) => m,
            (Some(l), Some(m)) => l || m,
        }
    }

    pub fn is_launch(name: &str) -> bool {
        LAUNCH_OPERATIONS.contains(&name)
    }
}

fn tokens(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|t| !t.is_empty())
}

fn parse_pattern(token: &str) -> TraceResult<Option<Regex>> {
    match token
        .strip_prefix('/')
        .and_then(|rest| rest.strip_suffix('/'))
    {
        Some(pattern) => Regex::new(pattern)
            .map(Some)
            .map_err(|e| TraceError::InvalidFilter(format!("bad regex /{}/: {}", pattern, e))),
        None => Ok(None),
    }
}

fn expand_class(token: &str) -> Vec<String> {
    let class: &[&str] = match token {
        "launch" => LAUNCH_OPERATIONS,
        "memcpy" => MEMCPY_OPERATIONS,
        "memory" => MEMORY_OPERATIONS,
        other => return vec![other.to_string()],
    };
    class.iter().map(|s| s.to_string()).collect()
}
