use upkeep_core::{PluginUpdateStatus, VersionInfo};

/// Number of distinct things the admin could update right now.
pub fn total_available_updates(info: &VersionInfo) -> usize {
    let mut count = 0;
    if info.app_update_available() && !info.releases.is_empty() {
        count += 1;
    }
    count += info
        .plugins
        .iter()
        .filter(|plugin| {
            plugin.status == PluginUpdateStatus::UpdateAvailable && !plugin.releases.is_empty()
        })
        .count();
    count
}

pub fn critical_app_update_available(info: &VersionInfo) -> bool {
    info.app_update_available()
        && (info.critical || info.releases.iter().any(|release| release.critical))
}

pub fn critical_plugin_update_available(info: &VersionInfo) -> bool {
    info.plugins.iter().any(|plugin| {
        plugin.status == PluginUpdateStatus::UpdateAvailable
            && plugin.releases.iter().any(|release| release.critical)
    })
}
