use crate::config::PipelineConfig;
use crate::error::Result;
use crate::planner::Plan;

pub mod bootsvc;
pub mod core;
pub mod fetch;
pub mod flash;
pub mod rootfs;
pub mod util;

pub trait Module {
    fn id(&self) -> &'static str;
    fn detect(&self, cfg: &PipelineConfig) -> bool;
    fn plan(&self, cfg: &PipelineConfig, plan: &mut Plan) -> Result<()>;
}

pub fn builtin_modules() -> Vec<Box<dyn Module>> {
    vec![
        Box::new(core::CoreModule),
        Box::new(fetch::FetchModule),
        Box::new(rootfs::RootfsModule),
        Box::new(bootsvc::BootServiceModule),
        Box::new(flash::FlashModule),
    ]
}

/// Builds the full plan for a run.
pub fn plan_pipeline(cfg: &PipelineConfig) -> Result<Plan> {
    let mut plan = Plan::default();
    for m in builtin_modules() {
        if m.detect(cfg) {
            m.plan(cfg, &mut plan)?;
        }
    }
    Ok(plan)
}
