//! What a registry does when a name is registered twice.

/// Duplicate-name handling, fixed when a registry is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    /// Keep both; the new entry gets the first free `"{name}_{n}"`.
    CreateNew,
    /// Replace the existing entry.
    Overwrite,
    /// Keep the existing entry and drop the new one.
    Ignore,
    /// Refuse the registration.
    #[default]
    Raise,
}

/// Outcome of applying a [`DuplicatePolicy`] to a new key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Insert(String),
    Replace(String),
    Skip,
    Reject,
}

impl DuplicatePolicy {
    /// Decide what to do with `key` given the keys already present.
    pub fn resolve<F>(self, exists: F, key: &str) -> Resolution
    where
        F: Fn(&str) -> bool,
    {
        if !exists(key) {
            return Resolution::Insert(key.to_string());
        }

        match self {
            DuplicatePolicy::CreateNew => {
                let mut n = 1usize;
                loop {
                    let candidate = format!("{}_{}", key, n);
                    if !exists(&candidate) {
                        return Resolution::Insert(candidate);
                    }
                    n += 1;
                }
            }
            DuplicatePolicy::Overwrite => Resolution::Replace(key.to_string()),
            DuplicatePolicy::Ignore => Resolution::Skip,
            DuplicatePolicy::Raise => Resolution::Reject,
        }
    }
}
