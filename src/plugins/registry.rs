//! Built-in plugin set.
//!
//! Both processes register the same set; each host's scope decides which
//! of them actually start.

use crate::plugins::cleanup::FixUncleanShutdown;
use crate::plugins::uptime::UptimeReport;
use crate::plugins::Plugin;

pub fn enabled_plugins() -> Vec<Box<dyn Plugin>> {
    vec![
        Box::new(UptimeReport::new()),
        Box::new(FixUncleanShutdown::new()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_unique() {
        let plugins = enabled_plugins();
        let mut names: Vec<&str> = plugins.iter().map(|p| p.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), plugins.len());
    }
}
