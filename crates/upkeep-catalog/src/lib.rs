mod cache;
mod catalog;
mod summary;

pub use cache::UpdateCache;
pub use catalog::{AppReleaseResponse, CatalogResponse, HttpReleaseCatalog, ReleaseCatalog};
pub use summary::{
    critical_app_update_available, critical_plugin_update_available, total_available_updates,
};

#[cfg(test)]
mod tests;
