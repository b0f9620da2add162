// The per-torrent stage machine: fetch metadata (magnet only), choose
// files, download, seed, stop. Listeners registered per event see the
// would-be-next stage and return the actual one; returning None ends
// processing, which is how "stop when downloaded" is expressed.

use std::collections::HashMap;

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    FetchMetadata,
    ChooseFiles,
    Download,
    Seed,
    Stop,
}

/// Events that listeners can hook. Fired when the corresponding stage
/// finishes, before the transition is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineEvent {
    TorrentFetched,
    FilesChosen,
    DownloadComplete,
}

pub type StageListener<C> = Box<dyn Fn(&mut C, Option<Stage>) -> Option<Stage> + Send + Sync>;
pub type StageProcessor<C> = Box<dyn Fn(&mut C) -> anyhow::Result<Option<Stage>> + Send + Sync>;

struct StageEntry<C> {
    processor: StageProcessor<C>,
    completion_event: Option<PipelineEvent>,
}

pub struct Pipeline<C> {
    stages: HashMap<Stage, StageEntry<C>>,
    listeners: HashMap<PipelineEvent, Vec<StageListener<C>>>,
}

impl<C> Default for Pipeline<C> {
    fn default() -> Self {
        Self {
            stages: HashMap::new(),
            listeners: HashMap::new(),
        }
    }
}

impl<C> Pipeline<C> {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn stage(
        &mut self,
        stage: Stage,
        completion_event: Option<PipelineEvent>,
        processor: impl Fn(&mut C) -> anyhow::Result<Option<Stage>> + Send + Sync + 'static,
    ) -> &mut Self {
        self.stages.insert(
            stage,
            StageEntry {
                processor: Box::new(processor),
                completion_event,
            },
        );
        self
    }

    pub fn on(
        &mut self,
        event: PipelineEvent,
        listener: impl Fn(&mut C, Option<Stage>) -> Option<Stage> + Send + Sync + 'static,
    ) -> &mut Self {
        self.listeners
            .entry(event)
            .or_default()
            .push(Box::new(listener));
        self
    }

    /// Applies listeners in registration order. Each sees the previous
    /// result; a None short-circuits the chain and terminates.
    fn apply_listeners(
        &self,
        event: PipelineEvent,
        ctx: &mut C,
        mut next: Option<Stage>,
    ) -> Option<Stage> {
        if let Some(listeners) = self.listeners.get(&event) {
            for listener in listeners {
                next = listener(ctx, next);
                if next.is_none() {
                    break;
                }
            }
        }
        next
    }

    /// Runs the chain from `start` until a stage (or a listener)
    /// yields no successor.
    pub fn run(&self, ctx: &mut C, start: Stage) -> anyhow::Result<()> {
        let mut current = Some(start);
        while let Some(stage) = current {
            let entry = self
                .stages
                .get(&stage)
                .ok_or_else(|| anyhow::anyhow!("no processor registered for stage {stage:?}"))?;
            debug!("processing stage {:?}", stage);
            let next = (entry.processor)(ctx)?;
            current = match entry.completion_event {
                Some(event) => self.apply_listeners(event, ctx, next),
                None => next,
            };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct Ctx {
        visited: Vec<Stage>,
    }

    fn download_seed_pipeline() -> Pipeline<Ctx> {
        let mut p = Pipeline::new();
        p.stage(Stage::Download, Some(PipelineEvent::DownloadComplete), |ctx: &mut Ctx| {
            ctx.visited.push(Stage::Download);
            Ok(Some(Stage::Seed))
        });
        p.stage(Stage::Seed, None, |ctx: &mut Ctx| {
            ctx.visited.push(Stage::Seed);
            Ok(Some(Stage::Stop))
        });
        p.stage(Stage::Stop, None, |ctx: &mut Ctx| {
            ctx.visited.push(Stage::Stop);
            Ok(None)
        });
        p
    }

    #[test]
    fn test_default_chain_runs_to_stop() {
        let p = download_seed_pipeline();
        let mut ctx = Ctx::default();
        p.run(&mut ctx, Stage::Download).unwrap();
        assert_eq!(ctx.visited, vec![Stage::Download, Stage::Seed, Stage::Stop]);
    }

    #[test]
    fn test_stop_when_downloaded_listener_short_circuits() {
        let mut p = download_seed_pipeline();
        let flushes = Arc::new(AtomicUsize::new(0));
        let flushes2 = flushes.clone();
        // flush storage, then terminate instead of seeding
        p.on(PipelineEvent::DownloadComplete, move |_ctx, _next| {
            flushes2.fetch_add(1, Ordering::SeqCst);
            None
        });

        let mut ctx = Ctx::default();
        p.run(&mut ctx, Stage::Download).unwrap();
        assert_eq!(ctx.visited, vec![Stage::Download]);
        assert_eq!(flushes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listeners_compose_in_registration_order() {
        let mut p = download_seed_pipeline();
        // first listener redirects Seed -> Stop, second sees Stop
        p.on(PipelineEvent::DownloadComplete, |_ctx, next| {
            assert_eq!(next, Some(Stage::Seed));
            Some(Stage::Stop)
        });
        p.on(PipelineEvent::DownloadComplete, |_ctx, next| {
            assert_eq!(next, Some(Stage::Stop));
            next
        });
        let mut ctx = Ctx::default();
        p.run(&mut ctx, Stage::Download).unwrap();
        assert_eq!(ctx.visited, vec![Stage::Download, Stage::Stop]);
    }

    #[test]
    fn test_none_short_circuits_later_listeners() {
        let mut p = download_seed_pipeline();
        p.on(PipelineEvent::DownloadComplete, |_ctx, _next| None);
        p.on(PipelineEvent::DownloadComplete, |_ctx, _next| {
            panic!("must not be called after a None");
        });
        let mut ctx = Ctx::default();
        p.run(&mut ctx, Stage::Download).unwrap();
        assert_eq!(ctx.visited, vec![Stage::Download]);
    }
}
