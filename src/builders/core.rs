//! Core interfaces for builders.
//!
//! These interfaces organize building process as a resumable pipeline of named stages.
//! See [`Stage`] and [`Pipeline`].
//!
//! Every stage is checked against the status snapshot of the previous run. Stages recorded
//! there are skipped, the rest are executed in order. First failure stops the pipeline.
//! Resulting snapshot is meant to be saved after every run, so the next run can resume.

use anyhow::Result;
use log::{debug, error, info, warn};
use serde::Serialize;

use super::status::{StatusError, StatusSnapshot, StatusStore, StatusValue};

/// Stage in the pipeline.
pub trait Stage<Ctx> {
    /// Unique name of the stage. This is the key of its marker in the status snapshot.
    fn name(&self) -> &'static str;

    /// Markers of the resources this stage tears down.
    ///
    /// Non-empty list makes this a teardown stage: it is never skipped and never recorded.
    /// On success listed markers are removed from the new snapshot.
    fn releases(&self) -> &'static [&'static str] {
        &[]
    }

    /// Setup required on every run, even if the stage itself is going to be skipped.
    ///
    /// Failure here is fatal and aborts the pipeline before the stage precondition is checked.
    fn prepare(&mut self, _ctx: &mut Ctx) -> Result<()> {
        Ok(())
    }

    /// Whether the stage was already done according to the snapshot of previous run.
    fn is_satisfied(&self, prior: &StatusSnapshot) -> bool {
        self.releases().is_empty() && prior.is_done(self.name())
    }

    /// Restore context from the marker of previous run when the stage is skipped.
    fn restore(&mut self, _ctx: &mut Ctx, _marker: &StatusValue) -> Result<()> {
        Ok(())
    }

    /// Run stage.
    ///
    /// Returned value is recorded as stage marker. `None` is recorded as `true`.
    fn run(&mut self, ctx: &mut Ctx) -> Result<Option<String>>;
}

/// Stages of the pipeline.
pub type Stages<Ctx> = Vec<Box<dyn Stage<Ctx>>>;

/// State of a single stage after the pipeline run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageState {
    /// Stage was never reached.
    NotRun,

    /// Stage was done by a previous run.
    Skipped,

    /// Stage was executed successfully.
    Completed,

    /// Stage failed.
    Failed,
}

/// Per-stage report.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StageReport {
    pub name: &'static str,
    pub state: StageState,
}

/// Terminal outcome of the pipeline.
#[derive(Debug)]
pub enum Outcome {
    /// Every stage was either skipped or completed.
    Completed,

    /// Stage action failed.
    Failed {
        stage: &'static str,
        error: anyhow::Error,
    },

    /// Stage setup failed. There is no meaningful way to continue.
    Aborted {
        stage: &'static str,
        error: anyhow::Error,
    },
}

/// Result of the pipeline run.
#[derive(Debug)]
pub struct PipelineResult {
    pub outcome: Outcome,

    /// Snapshot to persist.
    pub snapshot: StatusSnapshot,

    /// Reports in order of stages.
    pub stages: Vec<StageReport>,

    /// Set if the snapshot was not persisted.
    pub save_error: Option<StatusError>,
}

impl PipelineResult {
    /// Whether pipeline completed and its snapshot was persisted.
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Completed) && self.save_error.is_none()
    }

    /// Number of stages with given state.
    pub fn count(&self, state: StageState) -> usize {
        self.stages.iter().filter(|r| r.state == state).count()
    }

    /// Name of the stage which stopped the pipeline.
    pub fn failed_stage(&self) -> Option<&'static str> {
        match &self.outcome {
            Outcome::Completed => None,
            Outcome::Failed { stage, .. } | Outcome::Aborted { stage, .. } => Some(*stage),
        }
    }
}

/// Direct pipeline, running stages in order of appearance.
pub struct Pipeline<'ctx, Ctx> {
    ctx: &'ctx mut Ctx,
    stages: Stages<Ctx>,
    cleanup_on_failure: bool,
}

impl<'ctx, Ctx> Pipeline<'ctx, Ctx> {
    /// Create new pipeline with given context.
    pub fn from_ctx(ctx: &'ctx mut Ctx) -> Self {
        Self {
            ctx,
            stages: Vec::new(),
            cleanup_on_failure: false,
        }
    }

    /// Add stage to the end of pipeline.
    pub fn add_stage(&mut self, stage: Box<dyn Stage<Ctx>>) {
        self.stages.push(stage);
    }

    /// Add stages to the end of pipeline.
    pub fn add_stages<I>(&mut self, stages: I)
    where
        I: IntoIterator<Item = Box<dyn Stage<Ctx>>>,
    {
        for stage in stages.into_iter() {
            self.add_stage(stage);
        }
    }

    /// Create new pipeline with given context and stages.
    pub fn from_stages<I>(ctx: &'ctx mut Ctx, stages: I) -> Self
    where
        I: IntoIterator<Item = Box<dyn Stage<Ctx>>>,
    {
        let mut pipeline = Self::from_ctx(ctx);
        pipeline.add_stages(stages);
        pipeline
    }

    /// Run teardown stages after a failure for resources still recorded in the snapshot.
    pub fn cleanup_on_failure(mut self, enabled: bool) -> Self {
        self.cleanup_on_failure = enabled;
        self
    }

    /// Names of the stages in order.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    /// Load previous snapshot from `store`, run pipeline and save the new snapshot.
    pub fn run(self, store: &StatusStore) -> PipelineResult {
        let prior = store.load();
        self.run_with_prior(&prior, store)
    }

    /// Run pipeline against given previous snapshot and save the new one to `store`.
    ///
    /// Snapshot is saved exactly once, whatever the outcome is.
    pub fn run_with_prior(self, prior: &StatusSnapshot, store: &StatusStore) -> PipelineResult {
        let mut result = self.execute(prior);
        result.save_error = store.save(&result.snapshot).err();
        result
    }

    /// Run pipeline against given previous snapshot without persisting anything.
    pub fn execute(self, prior: &StatusSnapshot) -> PipelineResult {
        let Pipeline {
            ctx,
            mut stages,
            cleanup_on_failure,
        } = self;

        let mut next = StatusSnapshot::new();
        let mut reports: Vec<StageReport> = stages
            .iter()
            .map(|stage| StageReport {
                name: stage.name(),
                state: StageState::NotRun,
            })
            .collect();
        let mut executed = 0usize;
        let mut outcome = Outcome::Completed;
        let mut stopped_at = None;

        for (idx, stage) in stages.iter_mut().enumerate() {
            let name = stage.name();

            if let Err(error) = stage.prepare(ctx) {
                error!("{}: setup failed: {:#}", name, error);
                reports[idx].state = StageState::Failed;
                outcome = Outcome::Aborted { stage: name, error };
                stopped_at = Some(idx);
                break;
            }

            if stage.is_satisfied(prior) {
                info!("{}: already done", name);
                if let Some(marker) = prior.get(name) {
                    if let Err(error) = stage.restore(ctx, marker) {
                        error!("{}: cannot reuse previous result: {:#}", name, error);
                        reports[idx].state = StageState::Failed;
                        outcome = Outcome::Failed { stage: name, error };
                        stopped_at = Some(idx);
                        break;
                    }
                    next.insert(name, marker.clone());
                }
                reports[idx].state = StageState::Skipped;
                continue;
            }

            debug!("{}: running", name);
            executed += 1;
            match stage.run(ctx) {
                Ok(value) => {
                    let released = stage.releases();
                    if released.is_empty() {
                        match value {
                            Some(value) => next.insert(name, value),
                            None => next.mark_done(name),
                        }
                    } else {
                        for key in released {
                            next.remove(key);
                        }
                    }
                    info!("{}: done", name);
                    reports[idx].state = StageState::Completed;
                }
                Err(error) => {
                    error!("{}: failed: {:#}", name, error);
                    reports[idx].state = StageState::Failed;
                    outcome = Outcome::Failed { stage: name, error };
                    stopped_at = Some(idx);
                    break;
                }
            }
        }

        if let Some(idx) = stopped_at {
            if cleanup_on_failure {
                for (offset, stage) in stages.iter_mut().enumerate().skip(idx + 1) {
                    let released = stage.releases();
                    if !released.iter().any(|key| next.contains(key)) {
                        continue;
                    }
                    warn!("{}: running teardown after failure", stage.name());
                    match stage.run(ctx) {
                        Ok(_) => {
                            for key in released {
                                next.remove(key);
                            }
                            reports[offset].state = StageState::Completed;
                        }
                        Err(error) => {
                            warn!("{}: teardown failed: {:#}", stage.name(), error);
                            reports[offset].state = StageState::Failed;
                        }
                    }
                }
            }
        } else if executed == 0 {
            // Nothing was done, so nothing can be lost.
            next = prior.clone();
        }

        PipelineResult {
            outcome,
            snapshot: next,
            stages: reports,
            save_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Outcome, Pipeline, Result, Stage, StageState, Stages};
    use crate::builders::status::{StatusSnapshot, StatusStore, StatusValue};
    use tempdir::TempDir;

    #[derive(Default)]
    struct TestCtx {
        calls: Vec<&'static str>,
        loopdev: Option<String>,
    }

    struct TestStage {
        name: &'static str,
        value: Option<&'static str>,
        fail: bool,
        fail_prepare: bool,
        fail_restore: bool,
        releases: &'static [&'static str],
    }

    impl TestStage {
        fn ok(name: &'static str) -> Box<Self> {
            Box::new(Self {
                name,
                value: None,
                fail: false,
                fail_prepare: false,
                fail_restore: false,
                releases: &[],
            })
        }

        fn failing(name: &'static str) -> Box<Self> {
            Box::new(Self {
                fail: true,
                ..*Self::ok(name)
            })
        }

        fn producing(name: &'static str, value: &'static str) -> Box<Self> {
            Box::new(Self {
                value: Some(value),
                ..*Self::ok(name)
            })
        }

        fn teardown(name: &'static str, releases: &'static [&'static str]) -> Box<Self> {
            Box::new(Self {
                releases,
                ..*Self::ok(name)
            })
        }
    }

    impl Stage<TestCtx> for TestStage {
        fn name(&self) -> &'static str {
            self.name
        }

        fn releases(&self) -> &'static [&'static str] {
            self.releases
        }

        fn prepare(&mut self, _ctx: &mut TestCtx) -> Result<()> {
            if self.fail_prepare {
                anyhow::bail!("cannot create directory");
            }
            Ok(())
        }

        fn restore(&mut self, ctx: &mut TestCtx, marker: &StatusValue) -> Result<()> {
            if self.fail_restore {
                anyhow::bail!("{} is gone", self.name);
            }
            if self.value.is_some() {
                ctx.loopdev = marker.as_str().map(str::to_string);
            }
            Ok(())
        }

        fn run(&mut self, ctx: &mut TestCtx) -> Result<Option<String>> {
            ctx.calls.push(self.name);
            if self.fail {
                anyhow::bail!("{} failed", self.name);
            }
            if let Some(value) = self.value {
                ctx.loopdev = Some(value.to_string());
            }
            Ok(self.value.map(str::to_string))
        }
    }

    /// create-image -> attach-loop -> mount -> unmount-and-detach
    fn four_stages(mount_fails: bool) -> Stages<TestCtx> {
        vec![
            TestStage::ok("create-image"),
            TestStage::producing("attach-loop", "/dev/loop7"),
            if mount_fails {
                TestStage::failing("mount")
            } else {
                TestStage::ok("mount")
            },
            TestStage::teardown(
                "unmount-and-detach",
                &["create-image", "attach-loop", "mount"],
            ),
        ]
    }

    fn snapshot(entries: &[(&str, StatusValue)]) -> StatusSnapshot {
        entries
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn test_pipeline_ok() {
        let mut ctx = TestCtx::default();
        let mut pipeline = Pipeline::from_ctx(&mut ctx);
        pipeline.add_stage(TestStage::ok("step1"));
        pipeline.add_stage(TestStage::ok("step2"));
        let result = pipeline.execute(&StatusSnapshot::new());
        assert!(result.is_success());
        assert_eq!(ctx.calls, ["step1", "step2"]);
    }

    #[test]
    fn test_pipeline_fail() {
        let mut ctx = TestCtx::default();
        let mut pipeline = Pipeline::from_ctx(&mut ctx);
        pipeline.add_stage(TestStage::failing("step2"));
        let result = pipeline.execute(&StatusSnapshot::new());
        assert!(!result.is_success());
        match result.outcome {
            Outcome::Failed { stage, error } => {
                assert_eq!(stage, "step2");
                assert_eq!(&error.to_string(), "step2 failed");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_done_stage_is_not_executed_again() {
        let mut ctx = TestCtx::default();
        let prior = snapshot(&[("create-image", true.into())]);
        let stages: Stages<TestCtx> = vec![TestStage::ok("create-image"), TestStage::ok("format")];
        let result = Pipeline::from_stages(&mut ctx, stages).execute(&prior);

        assert!(result.is_success());
        assert_eq!(ctx.calls, ["format"]);
        assert_eq!(result.stages[0].state, StageState::Skipped);
        assert_eq!(result.stages[1].state, StageState::Completed);
        assert!(result.snapshot.is_done("create-image"));
        assert!(result.snapshot.is_done("format"));
    }

    #[test]
    fn test_skipped_stage_restores_value() {
        let mut ctx = TestCtx::default();
        let prior = snapshot(&[("attach-loop", "/dev/loop3".into())]);
        let stages: Stages<TestCtx> = vec![TestStage::producing("attach-loop", "/dev/loop9")];
        let result = Pipeline::from_stages(&mut ctx, stages).execute(&prior);

        assert!(result.is_success());
        assert!(ctx.calls.is_empty());
        assert_eq!(ctx.loopdev.as_deref(), Some("/dev/loop3"));
        assert_eq!(result.snapshot, prior);
    }

    #[test]
    fn test_failed_restore_drops_marker() {
        let mut ctx = TestCtx::default();
        let prior = snapshot(&[
            ("create-image", "gone.img".into()),
            ("format", true.into()),
        ]);
        let stages: Stages<TestCtx> = vec![
            Box::new(TestStage {
                fail_restore: true,
                ..*TestStage::producing("create-image", "disk.img")
            }),
            TestStage::ok("format"),
        ];
        let result = Pipeline::from_stages(&mut ctx, stages).execute(&prior);

        assert_eq!(result.failed_stage(), Some("create-image"));
        assert!(ctx.calls.is_empty());
        assert_eq!(result.stages[0].state, StageState::Failed);
        assert_eq!(result.stages[1].state, StageState::NotRun);
        assert!(result.snapshot.is_empty());
    }

    #[test]
    fn test_fail_fast() {
        let mut ctx = TestCtx::default();
        let stages: Stages<TestCtx> = vec![
            TestStage::ok("one"),
            TestStage::ok("two"),
            TestStage::failing("three"),
            TestStage::ok("four"),
            TestStage::ok("five"),
        ];
        let result = Pipeline::from_stages(&mut ctx, stages).execute(&StatusSnapshot::new());

        assert!(!result.is_success());
        assert_eq!(result.failed_stage(), Some("three"));
        assert_eq!(ctx.calls, ["one", "two", "three"]);
        assert_eq!(
            result.snapshot,
            snapshot(&[("one", true.into()), ("two", true.into())])
        );
        assert_eq!(result.stages[2].state, StageState::Failed);
        assert_eq!(result.stages[3].state, StageState::NotRun);
        assert_eq!(result.stages[4].state, StageState::NotRun);
    }

    #[test]
    fn test_noop_run_keeps_prior_snapshot() {
        let mut ctx = TestCtx::default();
        let prior = snapshot(&[
            ("one", true.into()),
            ("two", "value".into()),
            ("left-by-older-version", true.into()),
        ]);
        let stages: Stages<TestCtx> =
            vec![TestStage::ok("one"), TestStage::producing("two", "other")];
        let result = Pipeline::from_stages(&mut ctx, stages).execute(&prior);

        assert!(result.is_success());
        assert!(ctx.calls.is_empty());
        assert_eq!(result.snapshot, prior);
    }

    #[test]
    fn test_teardown_clears_transient_marker() {
        let mut ctx = TestCtx::default();
        let stages: Stages<TestCtx> = vec![
            TestStage::producing("image-file-created", "disk.img"),
            TestStage::producing("loop-device-attached", "/dev/loop0"),
            TestStage::ok("bootstrapped"),
            TestStage::teardown("loop-device-detached", &["loop-device-attached"]),
        ];
        let result = Pipeline::from_stages(&mut ctx, stages).execute(&StatusSnapshot::new());

        assert!(result.is_success());
        assert!(!result.snapshot.contains("loop-device-attached"));
        assert!(!result.snapshot.contains("loop-device-detached"));
        assert_eq!(
            result.snapshot,
            snapshot(&[
                ("image-file-created", "disk.img".into()),
                ("bootstrapped", true.into()),
            ])
        );
    }

    #[test]
    fn test_teardown_runs_even_if_prior_has_marker() {
        let mut ctx = TestCtx::default();
        let prior = snapshot(&[
            ("loop-device-attached", "/dev/loop0".into()),
            ("loop-device-detached", true.into()),
        ]);
        let stages: Stages<TestCtx> = vec![
            TestStage::producing("loop-device-attached", "/dev/loop1"),
            TestStage::teardown("loop-device-detached", &["loop-device-attached"]),
        ];
        let result = Pipeline::from_stages(&mut ctx, stages).execute(&prior);

        assert!(result.is_success());
        assert_eq!(ctx.calls, ["loop-device-detached"]);
        assert_eq!(ctx.loopdev.as_deref(), Some("/dev/loop0"));
        assert!(result.snapshot.is_empty());
    }

    #[test]
    fn test_scenario_all_stages_succeed() -> Result<()> {
        let tmp = TempDir::new("test-pipeline")?;
        let store = StatusStore::new(tmp.path().join(".status"));
        let initial = store.load();

        let mut ctx = TestCtx::default();
        let result = Pipeline::from_stages(&mut ctx, four_stages(false)).run(&store);

        assert!(result.is_success());
        assert_eq!(ctx.calls.len(), 4);
        assert_eq!(result.snapshot, initial);
        assert_eq!(store.load(), initial);
        Ok(())
    }

    #[test]
    fn test_scenario_mount_fails() -> Result<()> {
        let tmp = TempDir::new("test-pipeline")?;
        let store = StatusStore::new(tmp.path().join(".status"));

        let mut ctx = TestCtx::default();
        let result = Pipeline::from_stages(&mut ctx, four_stages(true)).run(&store);

        assert!(!result.is_success());
        assert_eq!(ctx.calls, ["create-image", "attach-loop", "mount"]);
        let expected = snapshot(&[
            ("create-image", true.into()),
            ("attach-loop", "/dev/loop7".into()),
        ]);
        assert_eq!(result.snapshot, expected);
        assert_eq!(store.load(), expected);
        Ok(())
    }

    #[test]
    fn test_resume_after_failure() -> Result<()> {
        let tmp = TempDir::new("test-pipeline")?;
        let store = StatusStore::new(tmp.path().join(".status"));

        let mut ctx = TestCtx::default();
        let first = Pipeline::from_stages(&mut ctx, four_stages(true)).run(&store);
        assert!(!first.is_success());

        let mut ctx = TestCtx::default();
        let second = Pipeline::from_stages(&mut ctx, four_stages(false)).run(&store);
        assert!(second.is_success());
        assert_eq!(ctx.calls, ["mount", "unmount-and-detach"]);
        assert_eq!(ctx.loopdev.as_deref(), Some("/dev/loop7"));
        assert!(store.load().is_empty());
        Ok(())
    }

    #[test]
    fn test_prepare_failure_aborts_before_precondition() {
        let mut ctx = TestCtx::default();
        let prior = snapshot(&[("mount-boot", true.into())]);
        let stages: Stages<TestCtx> = vec![
            TestStage::ok("mount-root"),
            Box::new(TestStage {
                fail_prepare: true,
                ..*TestStage::ok("mount-boot")
            }),
            TestStage::ok("bootstrap"),
        ];
        let result = Pipeline::from_stages(&mut ctx, stages).execute(&prior);

        assert!(!result.is_success());
        assert!(matches!(
            result.outcome,
            Outcome::Aborted {
                stage: "mount-boot",
                ..
            }
        ));
        assert_eq!(ctx.calls, ["mount-root"]);
        assert_eq!(result.snapshot, snapshot(&[("mount-root", true.into())]));
    }

    #[test]
    fn test_cleanup_on_failure_tears_down_recorded_resources() {
        let mut ctx = TestCtx::default();
        let stages: Stages<TestCtx> = vec![
            TestStage::producing("loop-device-attached", "/dev/loop0"),
            TestStage::ok("root-mounted"),
            TestStage::failing("bootstrapped"),
            TestStage::teardown("boot-unmounted", &["boot-mounted"]),
            TestStage::teardown("root-unmounted", &["root-mounted"]),
            TestStage::teardown("loop-device-detached", &["loop-device-attached"]),
        ];
        let result = Pipeline::from_stages(&mut ctx, stages)
            .cleanup_on_failure(true)
            .execute(&StatusSnapshot::new());

        assert!(!result.is_success());
        assert_eq!(
            ctx.calls,
            [
                "loop-device-attached",
                "root-mounted",
                "bootstrapped",
                "root-unmounted",
                "loop-device-detached"
            ]
        );
        assert_eq!(result.stages[3].state, StageState::NotRun);
        assert_eq!(result.stages[4].state, StageState::Completed);
        assert!(result.snapshot.is_empty());
    }

    #[test]
    fn test_save_failure_is_reported() -> Result<()> {
        let tmp = TempDir::new("test-pipeline")?;
        let store = StatusStore::new(tmp.path().join("missing").join(".status"));
        let mut ctx = TestCtx::default();
        let stages: Stages<TestCtx> = vec![TestStage::ok("one")];
        let result = Pipeline::from_stages(&mut ctx, stages).run(&store);

        assert!(matches!(result.outcome, Outcome::Completed));
        assert!(result.save_error.is_some());
        assert!(!result.is_success());
        Ok(())
    }
}
