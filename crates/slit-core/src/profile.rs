use std::{collections::BTreeMap, fmt, sync::Arc};

use bpf_common::Tracepoint;

use crate::{error::ProfileError, point::ObservationPoint};

/// Named set of observation points, the unit the observer is started with.
#[derive(Clone)]
pub struct Profile {
    name: String,
    points: BTreeMap<&'static str, Arc<dyn ObservationPoint>>,
}

impl Profile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            points: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a point. Names must be unique.
    pub fn add<P: ObservationPoint>(&mut self, point: P) -> Result<(), ProfileError> {
        self.add_shared(Arc::new(point))
    }

    pub fn add_shared(&mut self, point: Arc<dyn ObservationPoint>) -> Result<(), ProfileError> {
        let name = point.name();
        if self.points.contains_key(name) {
            return Err(ProfileError::Duplicate(name.to_string()));
        }
        self.points.insert(name, point);
        Ok(())
    }

    /// Builder flavour of [`Profile::add`].
    pub fn with<P: ObservationPoint>(mut self, point: P) -> Result<Self, ProfileError> {
        self.add(point)?;
        Ok(self)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.points.keys().copied()
    }

    pub fn points(&self) -> impl Iterator<Item = &Arc<dyn ObservationPoint>> {
        self.points.values()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Every tracepoint needed by the registered points, each listed once.
    pub fn tracepoints(&self) -> Vec<Tracepoint> {
        let mut tracepoints: Vec<Tracepoint> = Vec::new();
        for tracepoint in self.points().flat_map(|point| point.tracepoints()) {
            if !tracepoints.contains(&tracepoint) {
                tracepoints.push(tracepoint);
            }
        }
        tracepoints
    }
}

impl fmt::Debug for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Profile")
            .field("name", &self.name)
            .field("points", &self.points.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use async_trait::async_trait;
    use bpf_common::{RawRecord, parsing::DecodeError};

    use super::*;
    use crate::point::Disposition;

    struct Named(&'static str, Tracepoint);

    #[async_trait]
    impl ObservationPoint for Named {
        fn name(&self) -> &'static str {
            self.0
        }

        fn tracepoints(&self) -> Vec<Tracepoint> {
            vec![self.1.clone()]
        }

        async fn handle(&self, _record: &RawRecord) -> Result<Disposition, DecodeError> {
            Ok(Disposition::Dropped)
        }
    }

    const EXECVE: Tracepoint = Tracepoint::new("syscalls", "sys_enter_execve", "enter_execve");
    const CLONE: Tracepoint = Tracepoint::new("syscalls", "sys_enter_clone", "enter_clone");

    #[test]
    fn names_are_unique() {
        let mut profile = Profile::new("test");
        profile.add(Named("ProcessExecuted", EXECVE)).unwrap();
        assert_eq!(
            profile.add(Named("ProcessExecuted", CLONE)),
            Err(ProfileError::Duplicate("ProcessExecuted".to_string()))
        );
        assert_eq!(profile.len(), 1);
    }

    #[test]
    fn shared_tracepoints_are_listed_once() {
        let profile = Profile::new("test")
            .with(Named("A", EXECVE))
            .unwrap()
            .with(Named("B", EXECVE))
            .unwrap()
            .with(Named("C", CLONE))
            .unwrap();
        assert_eq!(profile.tracepoints(), vec![EXECVE, CLONE]);
        assert_eq!(profile.names().collect::<Vec<_>>(), vec!["A", "B", "C"]);
    }
}
