//! CPU / IO scheduling hints for external stages.

use crate::backup::validate::find_tool;
use serde::Deserialize;
use serde_with::{serde_as, DisplayFromStr};
use std::ffi::OsString;
use validator::Validate;

#[serde_as]
#[derive(Clone, Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct PriorityConfig {
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[validate(range(min = -20, max = 19))]
    pub nice_level: Option<i32>,
    /// 1 realtime, 2 best-effort, 3 idle
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[validate(range(min = 0, max = 3))]
    pub ionice_class: Option<u8>,
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[validate(range(min = 0, max = 7))]
    pub ionice_priority: Option<u8>,
}

/// Command prefix applying the configured hints, e.g.
/// `nice -n 10 ionice -c 2 -n 7`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Priority {
    prefix: Vec<OsString>,
}

impl Priority {
    /// Resolves `nice`/`ionice` on `PATH`; a missing helper only drops its hint.
    pub fn resolve(config: &PriorityConfig) -> Self {
        Self::resolve_with(config, |tool| find_tool(tool).map(|p| p.into_os_string()))
    }

    fn resolve_with<F: Fn(&str) -> Option<OsString>>(config: &PriorityConfig, lookup: F) -> Self {
        let mut prefix = Vec::new();

        if let Some(level) = config.nice_level {
            match lookup("nice") {
                Some(nice) => prefix.extend([nice, "-n".into(), level.to_string().into()]),
                None => tracing::warn!("NICE_LEVEL={level} ignored, `nice` not found on PATH"),
            }
        }

        let class = config
            .ionice_class
            .or(config.ionice_priority.map(|_| 2));
        if let Some(class) = class {
            match lookup("ionice") {
                Some(ionice) => {
                    prefix.extend([ionice, "-c".into(), class.to_string().into()]);
                    // only realtime and best-effort take a level
                    if let (Some(level), 1 | 2) = (config.ionice_priority, class) {
                        prefix.extend(["-n".into(), level.to_string().into()]);
                    }
                }
                None => tracing::warn!("IONICE_CLASS={class} ignored, `ionice` not found on PATH"),
            }
        }

        Self { prefix }
    }

    pub fn is_empty(&self) -> bool {
        self.prefix.is_empty()
    }

    /// Returns the program and argument list to actually execute.
    pub fn wrap(&self, program: OsString, args: Vec<OsString>) -> (OsString, Vec<OsString>) {
        match self.prefix.split_first() {
            None => (program, args),
            Some((head, rest)) => {
                let mut wrapped = rest.to_vec();
                wrapped.push(program);
                wrapped.extend(args);
                (head.clone(), wrapped)
            }
        }
    }
}
