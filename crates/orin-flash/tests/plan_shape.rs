use std::sync::Arc;
use std::sync::mpsc;

use orin_flash::config::{FlashProfile, PipelineConfig, PipelineRequest};
use orin_flash::executor::{self, ChannelSink, ExecCtx, ExecEvent};
use orin_flash::modules;

fn config(req: PipelineRequest) -> PipelineConfig {
    PipelineConfig::new(req, FlashProfile::default()).expect("config")
}

fn ordered_ids(cfg: &PipelineConfig) -> Vec<String> {
    let plan = modules::plan_pipeline(cfg).expect("plan");
    plan.ordered()
        .expect("order")
        .iter()
        .map(|t| t.id.clone())
        .collect()
}

#[test]
fn fetch_only_plans_prepare_stages_and_no_flashing() {
    let ids = ordered_ids(&config(PipelineRequest {
        fetch: true,
        version: Some("36.4.4".into()),
        ..Default::default()
    }));

    for expected in [
        "core.init",
        "fetch.bsp",
        "fetch.rootfs",
        "fetch.extract",
        "rootfs.binaries",
        "rootfs.modules",
        "bootsvc.install",
    ] {
        assert!(ids.iter().any(|id| id == expected), "missing {expected} in {ids:?}");
    }
    assert!(!ids.iter().any(|id| id.starts_with("flash.")), "{ids:?}");
    assert!(!ids.iter().any(|id| id == "rootfs.overlay"), "{ids:?}");
}

#[test]
fn flash_only_plans_exactly_the_flashing_stages() {
    let ids = ordered_ids(&config(PipelineRequest {
        flash: true,
        ..Default::default()
    }));

    assert_eq!(
        ids,
        vec![
            "core.init",
            "flash.recovery",
            "flash.exports",
            "flash.run",
            "flash.cleanup",
        ]
    );
}

#[test]
fn combined_run_orders_overlay_and_flash_correctly() {
    let dir = tempfile::tempdir().expect("tempdir");
    let overlay = dir.path().join("overlay.tbz2");
    std::fs::write(&overlay, "not a real tarball").expect("write");

    let ids = ordered_ids(&config(PipelineRequest {
        fetch: true,
        flash: true,
        overlay: Some(overlay),
        version: Some("36.4.4".into()),
        ..Default::default()
    }));

    let pos = |id: &str| {
        ids.iter()
            .position(|x| x == id)
            .unwrap_or_else(|| panic!("missing {id} in {ids:?}"))
    };

    assert!(pos("rootfs.overlay") < pos("rootfs.binaries"));
    assert!(pos("rootfs.binaries") < pos("rootfs.modules"));
    assert!(pos("rootfs.modules") < pos("bootsvc.install"));
    assert!(pos("bootsvc.install") < pos("flash.recovery"));
    assert!(pos("flash.recovery") < pos("flash.exports"));
    assert!(pos("flash.exports") < pos("flash.run"));
    assert!(pos("flash.run") < pos("flash.cleanup"));
}

#[test]
fn dry_run_walks_the_whole_plan_in_order() {
    let cfg = config(PipelineRequest {
        fetch: true,
        flash: true,
        version: Some("36.4.4".into()),
        ..Default::default()
    });
    let plan = modules::plan_pipeline(&cfg).expect("plan");
    let expected: Vec<String> = plan
        .ordered()
        .expect("order")
        .iter()
        .map(|t| t.id.clone())
        .collect();

    let reg = executor::builtin_registry().expect("registry");
    let (tx, rx) = mpsc::channel();
    let mut ctx = ExecCtx::new(true, Arc::new(ChannelSink::new(tx)));
    executor::execute_plan(&cfg, &plan, &reg, &mut ctx).expect("dry run");
    drop(ctx);

    let events: Vec<ExecEvent> = rx.iter().collect();
    let started: Vec<String> = events
        .iter()
        .filter_map(|ev| match ev {
            ExecEvent::TaskStarted { id } => Some(id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(started, expected);

    assert!(matches!(
        events.last(),
        Some(ExecEvent::ExecutorDone { ok: true, .. })
    ));
    assert!(events.iter().all(|ev| !matches!(
        ev,
        ExecEvent::TaskFinished { ok: false, .. }
    )));
}
