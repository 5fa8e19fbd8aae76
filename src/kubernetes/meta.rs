//! Canonical identity strings for watched resources.

use std::fmt;

use snafu::Snafu;

/// Error returned when a meta string does not have four comma-separated
/// sections.
#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(display("meta string is not valid: {input:?}"))]
pub struct ParseMetaError {
    input: String,
}

/// Identity of one version of one resource.
///
/// The canonical string form is
/// `"{group}/{version},{kind},{namespace}/{name},{resourceVersion}"`, with
/// the group/version collapsing to a bare version for the core group and
/// the namespace/name collapsing to a bare name for cluster-scoped
/// objects, e.g. `apps/v1,Deployment,default/web,42` or
/// `v1,Node,edge-1,7`. Used as the custom tag of every published id so
/// versions of one resource sort next to each other.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct MetaKey {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub resource_version: String,
}

impl MetaKey {
    /// The `group/version` pair, or just `version` for the core group.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// `namespace/name`, or just `name` for cluster-scoped objects.
    pub fn qualified_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.namespace, self.name)
        }
    }

    /// The canonical form with the resource version stripped: the identity
    /// of the logical resource across its versions.
    pub fn logical_key(&self) -> String {
        format!(
            "{},{},{}",
            self.api_version(),
            self.kind,
            self.qualified_name()
        )
    }

    pub fn parse(s: &str) -> Result<Self, ParseMetaError> {
        let parts: Vec<&str> = s.split(',').collect();
        if parts.len() != 4 {
            return Err(ParseMetaError {
                input: s.to_owned(),
            });
        }
        let (group, version) = match parts[0].split_once('/') {
            Some((group, version)) => (group.to_owned(), version.to_owned()),
            None => (String::new(), parts[0].to_owned()),
        };
        let (namespace, name) = match parts[2].split_once('/') {
            Some((namespace, name)) => (namespace.to_owned(), name.to_owned()),
            None => (String::new(), parts[2].to_owned()),
        };
        Ok(MetaKey {
            group,
            version,
            kind: parts[1].to_owned(),
            namespace,
            name,
            resource_version: parts[3].to_owned(),
        })
    }
}

impl fmt::Display for MetaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.api_version(),
            self.kind,
            self.qualified_name(),
            self.resource_version
        )
    }
}
