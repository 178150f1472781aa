//! Datastore layout for guest files on the host.

use crate::runtime::constants::datastore::DEFAULT_ROOT;

/// Where guest directories and their files live on the host.
///
/// ```text
/// <root>/
///   <guest>/
///     <guest>.vmx
///     <guest>.nvram
///     <guest>.vmdk
///     <guest>-flat.vmdk
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatastoreLayout {
    root: String,
}

impl Default for DatastoreLayout {
    fn default() -> Self {
        Self::new(DEFAULT_ROOT)
    }
}

impl DatastoreLayout {
    pub fn new(root: impl Into<String>) -> Self {
        let root = root.into();
        let root = root.trim_end_matches('/').to_string();
        Self { root }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn guest_dir(&self, guest: &str) -> String {
        format!("{}/{}", self.root, guest)
    }

    pub fn guest_file(&self, guest: &str, suffix: &str) -> String {
        format!("{}/{}/{}{}", self.root, guest, guest, suffix)
    }

    pub fn vmx_path(&self, guest: &str) -> String {
        self.guest_file(guest, ".vmx")
    }
}

/// Template name is the last component of its directory.
pub fn template_name(template_dir: &str) -> &str {
    template_dir
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(template_dir)
}
