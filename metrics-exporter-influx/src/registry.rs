use std::sync::Arc;

use crate::snapshot::MetricSnapshot;

/// A source of metrics that can be visited by the exporter.
///
/// Implementations must allow being visited while the metrics they hold are concurrently registered and updated by
/// the rest of the application. The exporter never mutates a registry; it only reads from it once per reporting tick.
pub trait Registry {
    /// Calls `f` once for every registered metric, with the metric's name and a snapshot of its current value(s).
    fn visit(&self, f: &mut dyn FnMut(&str, MetricSnapshot));
}

impl<R> Registry for &R
where
    R: Registry + ?Sized,
{
    fn visit(&self, f: &mut dyn FnMut(&str, MetricSnapshot)) {
        (**self).visit(f);
    }
}

impl<R> Registry for Arc<R>
where
    R: Registry + ?Sized,
{
    fn visit(&self, f: &mut dyn FnMut(&str, MetricSnapshot)) {
        (**self).visit(f);
    }
}

impl<R> Registry for Box<R>
where
    R: Registry + ?Sized,
{
    fn visit(&self, f: &mut dyn FnMut(&str, MetricSnapshot)) {
        (**self).visit(f);
    }
}

/// A fixed set of named snapshots.
impl Registry for [(String, MetricSnapshot)] {
    fn visit(&self, f: &mut dyn FnMut(&str, MetricSnapshot)) {
        for (name, snapshot) in self {
            f(name, snapshot.clone());
        }
    }
}

impl Registry for Vec<(String, MetricSnapshot)> {
    fn visit(&self, f: &mut dyn FnMut(&str, MetricSnapshot)) {
        self.as_slice().visit(f);
    }
}
