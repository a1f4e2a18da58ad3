use std::collections::BTreeMap;
use std::fmt;

use semver::{Version, VersionReq};
use upkeep_core::Requirement;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnmetRequirement {
    pub name: String,
    pub required: VersionReq,
    pub installed: Option<Version>,
    pub note: Option<String>,
}

impl fmt::Display for UnmetRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.installed {
            Some(installed) => write!(
                f,
                "{} {} is required but {} is installed",
                self.name, self.required, installed
            )?,
            None => write!(
                f,
                "{} {} is required but it is not available",
                self.name, self.required
            )?,
        }
        if let Some(note) = &self.note {
            write!(f, " ({note})")?;
        }
        Ok(())
    }
}

pub fn check_requirements(
    requirements: &[Requirement],
    capabilities: &BTreeMap<String, Version>,
) -> Vec<UnmetRequirement> {
    requirements
        .iter()
        .filter_map(|requirement| {
            let installed = capabilities.get(&requirement.name);
            let satisfied = installed.is_some_and(|version| requirement.version.matches(version));
            (!satisfied).then(|| UnmetRequirement {
                name: requirement.name.clone(),
                required: requirement.version.clone(),
                installed: installed.cloned(),
                note: requirement.note.clone(),
            })
        })
        .collect()
}
