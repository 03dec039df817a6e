use log::{info, warn};

use crate::{
    checkpoint::{CheckpointErr, CheckpointStore, Rejection, StepSelector},
    config::{ResumeMode, RunConfig},
    state::TrainingState,
};

/// How a run starts.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Fresh(TrainingState),
    Resumed(TrainingState),
}

impl Resolution {
    pub fn is_resumed(&self) -> bool {
        matches!(self, Self::Resumed(_))
    }

    pub fn into_state(self) -> TrainingState {
        match self {
            Self::Fresh(state) | Self::Resumed(state) => state,
        }
    }
}

/// Decides, once per run, whether to continue from a checkpoint.
pub struct ResumeCoordinator;

impl ResumeCoordinator {
    /// Resolves the starting state of the run.
    ///
    /// # Arguments
    /// * `store` - Where checkpoints live.
    /// * `config` - The configuration of this run.
    /// * `fresh` - Builds the initial state when nothing is resumed.
    ///
    /// # Errors
    /// A config mismatch, an unusable explicit step, any I/O failure, or no
    /// usable checkpoint while one is required.
    pub fn resolve<S, F>(store: &S, config: &RunConfig, fresh: F) -> Result<Resolution, CheckpointErr>
    where
        S: CheckpointStore + ?Sized,
        F: FnOnce() -> TrainingState,
    {
        if config.resume == ResumeMode::Off {
            info!("resume disabled, starting fresh");
            return Ok(Resolution::Fresh(fresh()));
        }

        let selector = config
            .resume_step
            .map_or(StepSelector::Latest, StepSelector::Step);

        match store.load(selector, config) {
            Ok(state) => {
                info!(step = state.step; "resuming at cursor {}", state.cursor);
                Ok(Resolution::Resumed(state))
            }
            Err(CheckpointErr::NoCheckpoint { dir, rejected }) if !config.require_checkpoint() => {
                report(&rejected);
                info!("no usable checkpoint in {}, starting fresh", dir.display());
                Ok(Resolution::Fresh(fresh()))
            }
            Err(e) => Err(e),
        }
    }
}

fn report(rejected: &[Rejection]) {
    for r in rejected {
        warn!(step = r.step; "checkpoint rejected: {}", r.reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        checkpoint::MemoryStore,
        data::Cursor,
        state::{NamedTensor, TensorSet},
    };

    fn config(resume: ResumeMode) -> RunConfig {
        RunConfig {
            resume,
            ..RunConfig::default()
        }
    }

    fn state_at(cfg: &RunConfig, step: u64) -> TrainingState {
        let model = TensorSet::new(vec![NamedTensor::new("w", vec![1], vec![step as f32])]);
        TrainingState {
            step,
            cursor: Cursor::new(0, step, 0),
            ..TrainingState::fresh(cfg.clone(), model, TensorSet::default())
        }
    }

    #[test]
    fn off_never_touches_the_store() {
        let cfg = config(ResumeMode::Off);
        let store = MemoryStore::new();
        store.save(&state_at(&cfg, 100)).unwrap();

        let res = ResumeCoordinator::resolve(&store, &cfg, || state_at(&cfg, 0)).unwrap();
        assert_eq!(res, Resolution::Fresh(state_at(&cfg, 0)));
    }

    #[test]
    fn auto_resumes_the_newest_usable_step() {
        let cfg = config(ResumeMode::Auto);
        let store = MemoryStore::new();
        store.save(&state_at(&cfg, 100)).unwrap();
        store.save(&state_at(&cfg, 200)).unwrap();
        store.insert_torn(300, "meta missing");

        let res = ResumeCoordinator::resolve(&store, &cfg, || state_at(&cfg, 0)).unwrap();
        assert!(res.is_resumed());
        let state = res.into_state();
        assert_eq!(state.step, 200);
        assert_eq!(state.cursor, Cursor::new(0, 200, 0));
    }

    #[test]
    fn auto_falls_back_to_fresh_when_everything_is_torn() {
        let cfg = config(ResumeMode::Auto);
        let store = MemoryStore::new();
        store.insert_torn(100, "model blob truncated");

        let res = ResumeCoordinator::resolve(&store, &cfg, || state_at(&cfg, 0)).unwrap();
        assert_eq!(res, Resolution::Fresh(state_at(&cfg, 0)));
    }

    #[test]
    fn require_turns_a_missing_checkpoint_fatal() {
        let cfg = config(ResumeMode::Require);
        let store = MemoryStore::new();
        store.insert_torn(100, "meta unparsable");

        let err = ResumeCoordinator::resolve(&store, &cfg, || state_at(&cfg, 0)).unwrap_err();
        match err {
            CheckpointErr::NoCheckpoint { rejected, .. } => {
                assert_eq!(rejected.len(), 1);
                assert_eq!(rejected[0].step, 100);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn explicit_step_never_falls_back() {
        let cfg = RunConfig {
            resume_step: Some(300),
            ..config(ResumeMode::Auto)
        };
        let store = MemoryStore::new();
        store.save(&state_at(&cfg, 200)).unwrap();
        store.insert_torn(300, "optimizer blob digest mismatch");

        let err = ResumeCoordinator::resolve(&store, &cfg, || state_at(&cfg, 0)).unwrap_err();
        assert!(matches!(err, CheckpointErr::Corrupt { step: 300, .. }));
    }

    #[test]
    fn architecture_change_is_fatal() {
        let saved = config(ResumeMode::Auto);
        let store = MemoryStore::new();
        store.save(&state_at(&saved, 100)).unwrap();

        let mut deeper = saved.clone();
        deeper.shape.set_depth(saved.shape.depth + 4);

        let err = ResumeCoordinator::resolve(&store, &deeper, || state_at(&deeper, 0)).unwrap_err();
        assert!(matches!(err, CheckpointErr::ConfigMismatch { step: 100, .. }));
    }
}
