pub(crate) mod daemon;
pub(crate) mod resolve;

fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs < 86400 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else {
        format!("{}d {}h", secs / 86400, (secs % 86400) / 3600)
    }
}

fn print_plugins(plugins: &[fleet::daemon::PluginInfo]) {
    if plugins.is_empty() {
        println!("  No plugin instances running");
        return;
    }

    let width = plugins
        .iter()
        .map(|p| p.instance.len())
        .max()
        .unwrap_or(0)
        .max("Instance".len());
    println!(
        "  {:<width$}  {:<12}  {:>8}  Connections",
        "Instance", "State", "PID"
    );
    for plugin in plugins {
        let pid = plugin
            .pid
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<width$}  {:<12}  {:>8}  {}",
            plugin.instance,
            plugin.state,
            pid,
            plugin.connections.join(", ")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_use_two_largest_units() {
        assert_eq!(format_duration(42), "42s");
        assert_eq!(format_duration(61), "1m 1s");
        assert_eq!(format_duration(7260), "2h 1m");
        assert_eq!(format_duration(90000), "1d 1h");
    }
}
