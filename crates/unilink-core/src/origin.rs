use std::fmt;

/// Opaque tag carried by every transaction the engine commits.
///
/// Change observers compare the origin of an incoming change against their
/// own token and skip changes they produced themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Origin(&'static str);

impl Origin {
    pub const USER: Origin = Origin("user");
    pub const BRACKET_SYNC: Origin = Origin("unilink-bracket-sync");
    pub const TAG_SYNC: Origin = Origin("unilink-tag-sync");
    pub const STATE: Origin = Origin("unilink-state");
    pub const RECONCILE: Origin = Origin("unilink-reconcile");
    pub const COMMAND: Origin = Origin("unilink-command");
    pub const MIGRATION: Origin = Origin("unilink-migration");
    pub const LOAD: Origin = Origin("unilink-load");

    pub const fn new(token: &'static str) -> Self {
        Origin(token)
    }

    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}
