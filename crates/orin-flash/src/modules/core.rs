use crate::config::PipelineConfig;
use crate::error::Result;
use crate::modules::Module;
use crate::planner::{Plan, Task};

pub struct CoreModule;

impl Module for CoreModule {
    fn id(&self) -> &'static str {
        "core"
    }

    fn detect(&self, _cfg: &PipelineConfig) -> bool {
        true
    }

    fn plan(&self, _cfg: &PipelineConfig, plan: &mut Plan) -> Result<()> {
        plan.add(Task {
            id: "core.init".into(),
            label: "Init workspace".into(),
            module: self.id().into(),
            phase: "init".into(),
            after: vec![],
            provides: vec!["core:ready".into()],
        })
    }
}
