//! Per-sample gradient instrumentation as an explicit capability.
//!
//! A plain model and an instrumented model are distinct types. An
//! [`Instrument`] implementation converts between them, and
//! [`with_instrumentation`] scopes the conversion so the plain model always
//! comes back hook-free, whatever the training body returns.

use tracing::warn;

use crate::error::{DpError, Result};
use crate::params::ParameterSet;

/// Returned when instrumentation cannot be attached; hands the model back.
#[derive(Debug)]
pub struct Refused<M> {
    /// The untouched plain model.
    pub model: M,
    /// Why the engine refused.
    pub reason: String,
}

/// Returned when a clean detach is not possible; hands the wrapper back.
#[derive(Debug)]
pub struct DetachFailed<W> {
    /// The still-instrumented model.
    pub wrapped: W,
    /// Why detaching failed.
    pub reason: String,
}

/// Idempotent removal of any leftover hooks or gradient caches.
pub trait StripHooks: Sized {
    /// Return the model with all instrumentation state removed.
    fn strip_hooks(self) -> Self;
}

impl StripHooks for ParameterSet {
    fn strip_hooks(self) -> Self {
        self
    }
}

/// Capability to attach per-sample gradient instrumentation to a model.
pub trait Instrument {
    /// The plain model type.
    type Plain: StripHooks;
    /// The instrumented model type.
    type Wrapped;

    /// Wrap a plain model.
    fn enable_instrumentation(
        &mut self,
        model: Self::Plain,
    ) -> std::result::Result<Self::Wrapped, Refused<Self::Plain>>;

    /// Cleanly unwrap a model.
    fn disable_instrumentation(
        &mut self,
        wrapped: Self::Wrapped,
    ) -> std::result::Result<Self::Plain, DetachFailed<Self::Wrapped>>;

    /// Forcefully unwrap a model, discarding all instrumentation state.
    fn strip(&mut self, wrapped: Self::Wrapped) -> Self::Plain;
}

/// Outcome of a scoped instrumented run.
#[derive(Debug)]
pub struct ScopedRun<M, T> {
    /// The plain, hook-free model.
    pub model: M,
    /// What the body returned, or why instrumentation could not be attached.
    pub outcome: Result<T>,
    /// Whether detaching failed and the wrapper had to be stripped.
    pub leaked: bool,
}

/// Run `body` on an instrumented view of `model` and always unwrap it again.
///
/// Release is attempted with [`Instrument::disable_instrumentation`]; if that
/// fails the wrapper is stripped and the run is flagged as leaked. The
/// returned model has had [`StripHooks::strip_hooks`] applied on every path.
pub fn with_instrumentation<I, T, F>(
    engine: &mut I,
    model: I::Plain,
    body: F,
) -> ScopedRun<I::Plain, T>
where
    I: Instrument,
    F: FnOnce(&mut I::Wrapped) -> Result<T>,
{
    let mut wrapped = match engine.enable_instrumentation(model) {
        Ok(wrapped) => wrapped,
        Err(Refused { model, reason }) => {
            return ScopedRun {
                model: model.strip_hooks(),
                outcome: Err(DpError::instrumentation(reason)),
                leaked: false,
            };
        }
    };

    let outcome = body(&mut wrapped);

    let (model, leaked) = match engine.disable_instrumentation(wrapped) {
        Ok(model) => (model, false),
        Err(DetachFailed { wrapped, reason }) => {
            warn!(%reason, "instrumentation did not detach cleanly, stripping");
            (engine.strip(wrapped), true)
        }
    };

    ScopedRun {
        model: model.strip_hooks(),
        outcome,
        leaked,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, PartialEq)]
    struct Model {
        hooks: usize,
    }

    impl StripHooks for Model {
        fn strip_hooks(mut self) -> Self {
            self.hooks = 0;
            self
        }
    }

    struct Wrapper(Model);

    #[derive(Default)]
    struct Engine {
        refuse: bool,
        fail_detach: bool,
        live: usize,
    }

    impl Instrument for Engine {
        type Plain = Model;
        type Wrapped = Wrapper;

        fn enable_instrumentation(
            &mut self,
            mut model: Model,
        ) -> std::result::Result<Wrapper, Refused<Model>> {
            if self.refuse {
                return Err(Refused {
                    model,
                    reason: "unsupported layer".into(),
                });
            }
            model.hooks += 2;
            self.live += 1;
            Ok(Wrapper(model))
        }

        fn disable_instrumentation(
            &mut self,
            wrapped: Wrapper,
        ) -> std::result::Result<Model, DetachFailed<Wrapper>> {
            if self.fail_detach {
                return Err(DetachFailed {
                    wrapped,
                    reason: "no detach".into(),
                });
            }
            self.live -= 1;
            let mut model = wrapped.0;
            model.hooks = 0;
            Ok(model)
        }

        fn strip(&mut self, wrapped: Wrapper) -> Model {
            self.live -= 1;
            wrapped.0
        }
    }

    #[test]
    fn clean_run_detaches() {
        let mut engine = Engine::default();
        let run = with_instrumentation(&mut engine, Model::default(), |w| Ok(w.0.hooks));
        assert_eq!(run.outcome.unwrap(), 2);
        assert!(!run.leaked);
        assert_eq!(run.model.hooks, 0);
        assert_eq!(engine.live, 0);
    }

    #[test]
    fn failing_body_still_releases() {
        let mut engine = Engine::default();
        let run: ScopedRun<Model, ()> = with_instrumentation(&mut engine, Model::default(), |_| {
            Err(DpError::local_training(0, "diverged"))
        });
        assert!(run.outcome.is_err());
        assert_eq!(run.model, Model::default());
        assert_eq!(engine.live, 0);
    }

    #[test]
    fn failed_detach_is_stripped_and_flagged() {
        let mut engine = Engine {
            fail_detach: true,
            ..Engine::default()
        };
        let run: ScopedRun<Model, ()> = with_instrumentation(&mut engine, Model::default(), |_| {
            Err(DpError::local_training(0, "diverged"))
        });
        assert!(run.leaked);
        assert_eq!(run.model.hooks, 0);
        assert_eq!(engine.live, 0);
    }

    #[test]
    fn refusal_returns_the_model() {
        let mut engine = Engine {
            refuse: true,
            ..Engine::default()
        };
        let run: ScopedRun<Model, ()> = with_instrumentation(&mut engine, Model::default(), |_| Ok(()));
        assert!(matches!(run.outcome, Err(DpError::Instrumentation { .. })));
        assert_eq!(run.model, Model::default());
    }
}
