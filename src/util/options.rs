use crate::util::constants::MAX_WORKERS;
use std::str::FromStr;

fn always_valid<T>(_: &T) -> bool {
    true
}

macro_rules! options {
    ($($(#[$outer:meta])*$name:ident: $type:ty [$validator:expr] = $default:expr),*,) => [
        options!($($(#[$outer])*$name: $type [$validator] = $default),*);
    ];
    ($($(#[$outer:meta])*$name:ident: $type:ty [$validator:expr] = $default:expr),*) => [
        /// The set of options the collector understands. Every option can be
        /// set from the environment (`SCYTHE_` prefix, upper-cased name) or
        /// programmatically through [`Options::set`], and is validated
        /// before it takes effect.
        #[derive(Clone)]
        pub struct Options {
            $($(#[$outer])* pub $name: $type),*
        }

        impl Options {
            /// Sets an option from its string representation. Returns an
            /// error naming the option on parse or validation failure.
            pub fn set(&mut self, name: &str, value: &str) -> Result<(), String> {
                match name {
                    $(stringify!($name) => {
                        let parsed = value.parse::<$type>().map_err(|_| {
                            format!("unable to parse {}={:?}", name, value)
                        })?;
                        let validate_fn = $validator;
                        if !validate_fn(&parsed) {
                            return Err(format!("invalid value {}={:?}", name, value));
                        }
                        self.$name = parsed;
                        Ok(())
                    })*
                    _ => Err(format!("unknown option {:?}", name)),
                }
            }

            /// Reads `SCYTHE_*` environment variables, applying every one
            /// that names a known option. Unknown variables are ignored;
            /// invalid values keep the default and are logged.
            pub fn read_env_var_settings(&mut self) {
                const PREFIX: &str = "SCYTHE_";
                for (key, value) in std::env::vars() {
                    if let Some(rest_of_key) = key.strip_prefix(PREFIX) {
                        let lowercase = rest_of_key.to_lowercase();
                        match lowercase.as_str() {
                            $(stringify!($name) => {
                                if let Err(err) = self.set(&lowercase, &value) {
                                    eprintln!("warning: {} (default kept)", err);
                                }
                            })*
                            _ => {}
                        }
                    }
                }
            }
        }

        impl Default for Options {
            fn default() -> Self {
                let mut options = Options {
                    $($name: $default),*
                };
                options.read_env_var_settings();
                options
            }
        }
    ]
}

options! {
    /// Number of tracing workers. Mark/gather stripes use the same count.
    threads:                        usize [|v: &usize| *v > 0 && *v <= MAX_WORKERS] = num_cpus::get().clamp(1, MAX_WORKERS),
    /// Run reachability analysis on multiple workers. When false every phase
    /// runs on the calling thread.
    allow_parallel:                 bool  [always_valid] = true,
    /// Spread BeginDestroy calls over multiple incremental purge ticks
    /// instead of running them to completion after each cycle.
    incremental_begin_destroy:      bool  [always_valid] = true,
    /// Destroy thread-safe objects on the dedicated purge thread.
    multithreaded_destruction:      bool  [always_valid] = true,
    /// How many times try_collect_garbage may be skipped on lock contention
    /// before the next attempt blocks.
    num_retries_before_forcing_gc:  usize [always_valid] = 10,
    /// Additional seconds granted to objects not ready for FinishDestroy
    /// after the base stall budget runs out.
    additional_finish_destroy_time: f64   [|v: &f64| *v >= 0.0] = 40.0,
    /// Escalate a stalled FinishDestroy queue to a fatal error once the
    /// extended budget is exhausted. When false the stall is logged once
    /// per cycle and the collector keeps waiting.
    time_limit_on_pending_destroy:  bool  [always_valid] = true,
    /// Null any killable reference whose target is flagged garbage, not
    /// just script-declared ones.
    reference_elimination:          bool  [always_valid] = true,
    /// 0 = off, 1 = report every reference that keeps a garbage-flagged
    /// object alive, 2 = report one per (referencing class, member) pair.
    garbage_reference_tracking:     u8    [|v: &u8| *v <= 2] = 0,
    /// Probability of running cluster/table invariant verification at the
    /// start of a cycle.
    verify_assumptions_chance:      f64   [|v: &f64| (0.0..=1.0).contains(v)] = 0.0,
}

impl Options {
    /// Fresh defaults without consulting the environment. Tests use this to
    /// stay independent of the harness environment.
    pub fn new_no_env_vars() -> Self {
        Options {
            threads: num_cpus::get().clamp(1, MAX_WORKERS),
            allow_parallel: true,
            incremental_begin_destroy: true,
            multithreaded_destruction: true,
            num_retries_before_forcing_gc: 10,
            additional_finish_destroy_time: 40.0,
            time_limit_on_pending_destroy: true,
            reference_elimination: true,
            garbage_reference_tracking: 0,
            verify_assumptions_chance: 0.0,
        }
    }
}

/// Garbage reference tracking levels, parsed from the numeric option.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GarbageTracking {
    Off,
    Verbose,
    Sampled,
}

impl GarbageTracking {
    pub fn from_option(value: u8) -> GarbageTracking {
        match value {
            0 => GarbageTracking::Off,
            1 => GarbageTracking::Verbose,
            _ => GarbageTracking::Sampled,
        }
    }
}

impl FromStr for GarbageTracking {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" | "0" => Ok(GarbageTracking::Off),
            "verbose" | "1" => Ok(GarbageTracking::Verbose),
            "sampled" | "2" => Ok(GarbageTracking::Sampled),
            _ => Err(format!("unknown garbage tracking mode {:?}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::serial_test;

    #[test]
    fn set_valid() {
        serial_test(|| {
            let mut options = Options::new_no_env_vars();
            assert!(options.set("threads", "1").is_ok());
            assert_eq!(options.threads, 1);
        })
    }

    #[test]
    fn set_invalid_value_keeps_default() {
        serial_test(|| {
            let mut options = Options::new_no_env_vars();
            let default_threads = options.threads;
            assert!(options.set("threads", "0").is_err());
            assert!(options.set("threads", "a").is_err());
            assert_eq!(options.threads, default_threads);
        })
    }

    #[test]
    fn set_unknown_key() {
        serial_test(|| {
            let mut options = Options::new_no_env_vars();
            assert!(options.set("stress_factor", "4096").is_err());
        })
    }

    #[test]
    fn env_var_settings_are_applied() {
        serial_test(|| {
            std::env::set_var("SCYTHE_GARBAGE_REFERENCE_TRACKING", "2");
            let mut options = Options::new_no_env_vars();
            options.read_env_var_settings();
            assert_eq!(options.garbage_reference_tracking, 2);
            std::env::remove_var("SCYTHE_GARBAGE_REFERENCE_TRACKING");
        })
    }

    #[test]
    fn tracking_mode_parsing() {
        assert_eq!(GarbageTracking::from_option(0), GarbageTracking::Off);
        assert_eq!("verbose".parse::<GarbageTracking>().unwrap(), GarbageTracking::Verbose);
        assert!("noisy".parse::<GarbageTracking>().is_err());
    }
}
