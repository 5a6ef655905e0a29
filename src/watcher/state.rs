/// Phase of a [`ResourceWatcher`](super::ResourceWatcher) loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Resolving the group/version/kind to an API resource.
    Initializing,
    /// Listing current objects to obtain a resource version.
    Listing,
    /// Streaming changes from the last known resource version.
    Watching,
    /// Waiting before the next attempt.
    Reconnecting,
    Closed,
}

impl Status {
    pub fn can_become(self, next: Status) -> bool {
        use Status::*;

        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Initializing, Listing | Reconnecting) => true,
            (Listing, Watching | Reconnecting) => true,
            (Watching, Reconnecting) => true,
            (Reconnecting, Initializing | Listing | Watching) => true,
            _ => false,
        }
    }
}

/// Bookkeeping owned by a single watcher loop.
#[derive(Debug)]
pub struct WatcherState {
    namespace: Option<String>,
    resource_version: Option<String>,
    status: Status,
}

impl WatcherState {
    pub fn new(namespace: Option<String>) -> Self {
        Self {
            namespace,
            resource_version: None,
            status: Status::Initializing,
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.resource_version.as_deref()
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Moves to `next`, returning the previous status.
    pub fn transition(&mut self, next: Status) -> Status {
        debug_assert!(
            self.status.can_become(next),
            "invalid watcher transition {:?} -> {next:?}",
            self.status,
        );
        std::mem::replace(&mut self.status, next)
    }

    /// Records a resource version seen on a list response, event or bookmark.
    ///
    /// Resource versions are opaque, so the latest observation always wins.
    pub fn observe_version(&mut self, version: Option<&str>) {
        if let Some(version) = version.filter(|v| !v.is_empty()) {
            self.resource_version = Some(version.to_owned());
        }
    }

    /// Forgets the resource version so the next attempt starts with a fresh list.
    pub fn invalidate(&mut self) {
        self.resource_version = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions() {
        use Status::*;

        assert!(Initializing.can_become(Listing));
        assert!(Listing.can_become(Watching));
        assert!(Watching.can_become(Reconnecting));
        assert!(Reconnecting.can_become(Listing));
        assert!(Reconnecting.can_become(Watching));
        assert!(Watching.can_become(Closed));

        assert!(!Initializing.can_become(Watching));
        assert!(!Watching.can_become(Listing));
        assert!(!Closed.can_become(Listing));
    }

    #[test]
    fn version_bookkeeping() {
        let mut state = WatcherState::new(Some("default".into()));
        assert_eq!(state.resource_version(), None);

        state.observe_version(Some("10"));
        state.observe_version(None);
        state.observe_version(Some(""));
        assert_eq!(state.resource_version(), Some("10"));

        state.observe_version(Some("12"));
        assert_eq!(state.resource_version(), Some("12"));

        state.invalidate();
        assert_eq!(state.resource_version(), None);
        assert_eq!(state.namespace(), Some("default"));
    }
}
