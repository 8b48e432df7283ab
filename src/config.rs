/*! Runtime configuration.

A [`Config`] is handed to [`runtime::init`](crate::runtime::init) exactly once
per runtime lifetime. It selects the scheduling backend, the worker/processor
layout, the monitoring callback table and (for the hierarchic backend) the
priority policy.
*/

use crate::monitor::MonitoringCallbacks;

/// Which scheduling dialect drives the workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Fully distributed: every worker owns a private ready queue.
    Decen,
    /// Hierarchic: one master thread owns a single priority queue and
    /// `num_workers - 1` workers pull tasks from it.
    Hrc,
}

/// Worker placement flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfigFlags {
    /// Pin each worker thread to its own CPU.
    pub pinned: bool,
    /// Additionally raise the workers to the real-time scheduling class.
    /// Requires `pinned` and the privilege to do so.
    pub exclusive: bool,
}

/// How the HRC master orders its ready queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrioPolicy {
    /// One of the numbered demand functions (1..=14). Out-of-range indices
    /// fall back to 14, the default `in - out`.
    Indexed(u8),
    /// A fresh random priority on every evaluation.
    Random,
    /// Host-assigned static priorities; the master performs no neighbour
    /// updates.
    Static,
}

impl Default for PrioPolicy {
    fn default() -> PrioPolicy {
        PrioPolicy::Indexed(14)
    }
}

/// Runtime configuration. See the field docs; `Config::default()` gives a
/// single-worker DECEN setup with no pinning and no monitoring.
#[derive(Clone)]
pub struct Config {
    /// Number of workers. For [`Backend::Hrc`] this includes the master, so
    /// at least 2 are required.
    pub num_workers: usize,
    /// Number of processors set aside for worker threads.
    pub proc_workers: usize,
    /// Number of processors set aside for everything else (wrappers etc).
    pub proc_others: usize,
    pub flags: ConfigFlags,
    pub backend: Backend,
    /// Monitoring callback table; all hooks optional.
    pub mon: MonitoringCallbacks,
    /// HRC priority policy.
    pub prio: PrioPolicy,
    /// HRC only: park a source task once the items pending on its outputs
    /// exceed this limit. `None` disables parking.
    pub neg_demand_limit: Option<i64>,
    /// DECEN only: run the placement scheduler task on worker 0.
    pub placement: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            num_workers: 1,
            proc_workers: 1,
            proc_others: 0,
            flags: ConfigFlags::default(),
            backend: Backend::Decen,
            mon: MonitoringCallbacks::default(),
            prio: PrioPolicy::default(),
            neg_demand_limit: None,
            placement: false,
        }
    }
}

/// Errors surfaced to the host by `init`/`start`. Everything else in the
/// runtime is a contract violation and asserts.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("cannot assign thread to processor: {0}")]
    Assign(String),
    #[error("cannot acquire exclusive (real-time) scheduling: {0}")]
    Exclusive(String),
}

/// Validate a configuration against the machine we run on.
///
/// `cores` is the number of online processors, or `None` if it could not be
/// determined (in which case the processor-count checks are skipped).
pub(crate) fn validate(cfg: &Config, cores: Option<usize>) -> Result<(), ConfigError> {
    let min_workers = match cfg.backend {
        Backend::Decen => 1,
        Backend::Hrc => 2, // one slot is the master
    };
    if cfg.num_workers < min_workers {
        return Err(ConfigError::Invalid(format!(
            "num_workers = {} (minimum {} for {:?})",
            cfg.num_workers, min_workers, cfg.backend
        )));
    }
    if cfg.proc_workers < 1 {
        return Err(ConfigError::Invalid("proc_workers must be >= 1".into()));
    }

    if let Some(cores) = cores {
        if cfg.proc_workers + cfg.proc_others > cores {
            return Err(ConfigError::Invalid(format!(
                "proc_workers + proc_others = {} exceeds the {} online processors",
                cfg.proc_workers + cfg.proc_others,
                cores
            )));
        }
        if cfg.flags.exclusive
            && (cfg.proc_others == 0 || cfg.num_workers > cfg.proc_workers)
        {
            return Err(ConfigError::Invalid(
                "exclusive requires a 1:1 worker/processor mapping and proc_others > 0".into(),
            ));
        }
    }

    if cfg.flags.exclusive {
        if !cfg.flags.pinned {
            return Err(ConfigError::Invalid(
                "exclusive requires pinned as well".into(),
            ));
        }
        // Stand-in for the CAP_SYS_NICE lookup: the real-time class is only
        // attempted when we are root.
        if unsafe { libc::geteuid() } != 0 {
            return Err(ConfigError::Exclusive(
                "process lacks the privilege to set real-time priorities".into(),
            ));
        }
    }

    if cfg.placement && cfg.backend != Backend::Decen {
        return Err(ConfigError::Invalid(
            "the placement scheduler only exists on the DECEN backend".into(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        validate(&Config::default(), Some(4)).unwrap();
    }

    #[test]
    fn hrc_needs_two_workers() {
        let cfg = Config {
            backend: Backend::Hrc,
            num_workers: 1,
            ..Config::default()
        };
        assert!(matches!(
            validate(&cfg, Some(4)),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn exclusive_requires_pinned() {
        let cfg = Config {
            num_workers: 2,
            proc_workers: 2,
            proc_others: 1,
            flags: ConfigFlags {
                pinned: false,
                exclusive: true,
            },
            ..Config::default()
        };
        assert!(matches!(
            validate(&cfg, Some(8)),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn too_many_procs() {
        let cfg = Config {
            proc_workers: 8,
            proc_others: 8,
            ..Config::default()
        };
        assert!(matches!(
            validate(&cfg, Some(4)),
            Err(ConfigError::Invalid(_))
        ));
    }
}
