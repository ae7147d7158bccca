#![cfg(test)]
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::sync::atomic::Ordering;
use std::time::Duration;

use v6seek_core::blacklist::BlacklistRegistry;
use v6seek_core::model::ModelParams;
use v6seek_core::pipeline::{Phase, PipelineError, PipelineSettings, StateMachine, StopReason};
use v6seek_core::prober::ProbeError;

use crate::util::{addr, prefix, seeds, settings, store, Fixture, ScriptedProber};

fn capped(max_iterations: u64) -> PipelineSettings {
    PipelineSettings {
        max_iterations,
        ..settings()
    }
}

fn step_until(machine: &mut StateMachine, done: impl Fn(&StateMachine) -> bool) {
    for _ in 0..500 {
        if done(machine) {
            return;
        }
        machine.step().unwrap();
    }
    panic!("condition not reached, trace: {:?}", machine.trace());
}

/// True right after MERGE of the first generated batch.
fn merged_first_batch(m: &StateMachine) -> bool {
    m.trace().last() == Some(&Phase::Merge)
        && m.state().iteration == 0
        && m.trace().contains(&Phase::Generate)
}

#[test]
fn fresh_run_seeds_before_training() {
    let fx = Fixture::new();
    let prober = ScriptedProber::documentation_net();
    let mut machine = fx.machine(&prober, BlacklistRegistry::empty(), capped(2));

    let summary = machine.run().unwrap();

    assert_eq!(
        &machine.trace()[..5],
        &[Phase::Init, Phase::SeedScan, Phase::Merge, Phase::Checkpoint, Phase::Train]
    );
    assert_eq!(summary.iterations, 2);
    assert_eq!(summary.stop_reason, Some(StopReason::IterationCap));
    assert_eq!(summary.total_candidates, 100);
    assert_eq!(summary.total_hits, 100);
    assert_eq!(summary.corpus_len, 32 + 100);

    let saved = store(fx.path()).load().unwrap().unwrap();
    assert_eq!(saved.state.phase, Phase::Terminal);
    assert_eq!(saved.state.iteration, 2);
    assert_eq!(saved.corpus.records, 132);
    assert!(saved.model.is_some());
}

#[test]
fn transient_timeouts_are_retried_within_scan() {
    let fx = Fixture::new();
    let prober = ScriptedProber::documentation_net();
    let mut machine = fx.machine(&prober, BlacklistRegistry::empty(), capped(1));

    step_until(&mut machine, |m| m.state().phase == Phase::Scan);
    prober.fail_next((0..3).map(|_| ProbeError::Timeout(Duration::from_secs(1))));
    let scans_before = prober.scans();

    assert_eq!(machine.step().unwrap(), Phase::Merge);
    assert_eq!(prober.scans() - scans_before, 4);

    let summary = machine.run().unwrap();
    assert_eq!(summary.iterations, 1);
    assert_eq!(summary.total_hits, 50);
}

#[test]
fn crash_between_merge_and_checkpoint_loses_nothing() {
    let fx = Fixture::new();
    let prober = ScriptedProber::documentation_net();

    let mut first = fx.machine(&prober, BlacklistRegistry::empty(), capped(3));
    step_until(&mut first, merged_first_batch);
    let merged = first.corpus().len();
    assert_eq!(merged, 32 + 50);
    drop(first);

    let mut second = fx.machine(&prober, BlacklistRegistry::empty(), capped(3));
    assert_eq!(second.step().unwrap(), Phase::Checkpoint);
    assert_eq!(second.corpus().len(), merged);
    assert_eq!(second.step().unwrap(), Phase::Train);
    assert_eq!(second.state().iteration, 1);
    assert_eq!(second.state().total_hits, 0);
    assert_eq!(second.state().total_candidates, 0);

    let summary = second.run().unwrap();
    assert_eq!(summary.iterations, 3);
    assert_eq!(summary.total_candidates, 100);
    assert_eq!(summary.total_hits, 100);
    assert_eq!(summary.corpus_len, 32 + 150);

    let probed = prober.probed();
    let unique: HashSet<_> = probed.iter().collect();
    assert_eq!(unique.len(), probed.len(), "an address was probed twice");
}

#[test]
fn iteration_cap_is_reevaluated_on_resume() {
    let fx = Fixture::new();
    let prober = ScriptedProber::documentation_net();

    let summary = fx
        .machine(&prober, BlacklistRegistry::empty(), capped(2))
        .run()
        .unwrap();
    assert_eq!(summary.iterations, 2);
    let scans = prober.scans();

    let mut same_cap = fx.machine(&prober, BlacklistRegistry::empty(), capped(2));
    let summary = same_cap.run().unwrap();
    assert_eq!(same_cap.trace(), &[Phase::Init]);
    assert_eq!(summary.stop_reason, Some(StopReason::IterationCap));
    assert_eq!(prober.scans(), scans);

    let summary = fx
        .machine(&prober, BlacklistRegistry::empty(), capped(4))
        .run()
        .unwrap();
    assert_eq!(summary.iterations, 4);
    assert_eq!(summary.corpus_len, 32 + 4 * 50);
}

#[test]
fn exhausted_address_space_converges() {
    let net = prefix("2001:db8::", 124);
    let seeds = (1..=4u128)
        .map(|i| v6seek_common::network::Address::from_u128(net.network().to_u128() | i))
        .collect();
    let fx = Fixture::with_seeds(seeds);
    let prober = ScriptedProber::documentation_net();
    let settings = PipelineSettings {
        batch_size: 10,
        max_iterations: 20,
        model: ModelParams {
            prefix_len: 124,
            min_cluster_size: 4,
            smoothing: 1.0,
            density_exponent: 1.0,
        },
        ..settings()
    };

    let mut machine = fx.machine(&prober, BlacklistRegistry::empty(), settings);
    let summary = machine.run().unwrap();

    assert_eq!(summary.stop_reason, Some(StopReason::Converged));
    assert_eq!(summary.corpus_len, 16);
    assert!(machine.corpus().iter().all(|a| net.contains(a)));
    assert!(machine.state().stalled_generations >= 3);
    assert!(machine
        .trace()
        .windows(2)
        .any(|w| w == [Phase::Generate, Phase::Checkpoint]));
}

#[test]
fn unchanged_corpus_reuses_the_model() {
    let fx = Fixture::new();
    let prober = ScriptedProber::only(seeds());
    let mut machine = fx.machine(&prober, BlacklistRegistry::empty(), capped(3));

    let summary = machine.run().unwrap();

    assert_eq!(summary.iterations, 3);
    assert_eq!(summary.corpus_len, 32);
    assert_eq!(summary.total_hits, 0);
    assert_eq!(summary.model_version, 1);
    assert_eq!(
        machine.trace().iter().filter(|p| **p == Phase::Train).count(),
        3
    );

    let saved = store(fx.path()).load().unwrap().unwrap();
    assert_eq!(saved.model.map(|m| m.version), Some(1));
}

#[test]
fn resume_loads_the_saved_model() {
    let fx = Fixture::new();
    let prober = ScriptedProber::only(seeds());
    fx.machine(&prober, BlacklistRegistry::empty(), capped(2))
        .run()
        .unwrap();

    let mut resumed = fx.machine(&prober, BlacklistRegistry::empty(), capped(4));
    assert_eq!(resumed.step().unwrap(), Phase::Train);
    assert_eq!(resumed.model().map(|m| m.version()), Some(1));

    let summary = resumed.run().unwrap();
    assert_eq!(summary.iterations, 4);
    assert_eq!(summary.model_version, 1);
}

#[test]
fn changed_model_params_force_a_retrain() {
    let fx = Fixture::new();
    let prober = ScriptedProber::only(seeds());
    fx.machine(&prober, BlacklistRegistry::empty(), capped(1))
        .run()
        .unwrap();

    let smoother = PipelineSettings {
        max_iterations: 2,
        model: ModelParams {
            smoothing: 0.5,
            ..settings().model
        },
        ..settings()
    };
    let mut resumed = fx.machine(&prober, BlacklistRegistry::empty(), smoother);
    assert_eq!(resumed.step().unwrap(), Phase::Train);
    assert!(resumed.model().is_none());

    assert_eq!(resumed.step().unwrap(), Phase::Generate);
    assert_eq!(resumed.model().map(|m| m.version()), Some(2));

    let summary = resumed.run().unwrap();
    assert_eq!(summary.iterations, 2);
    assert_eq!(summary.model_version, 2);
}

#[test]
fn blacklist_change_prunes_corpus() {
    let fx = Fixture::new();
    let prober = ScriptedProber::documentation_net();
    fx.machine(&prober, BlacklistRegistry::empty(), capped(1))
        .run()
        .unwrap();

    let blocked = BlacklistRegistry::parse("2001:db8:0:1::/64").unwrap();
    let mut second = fx.machine(&prober, blocked.clone(), capped(3));
    assert_eq!(second.step().unwrap(), Phase::Checkpoint);
    assert!(!second.corpus().is_empty());
    assert!(second.corpus().iter().all(|a| !blocked.contains(a)));

    let on_disk = store(fx.path()).corpus_log().read_all().unwrap().records;
    assert_eq!(on_disk.len(), second.corpus().len());
    assert!(on_disk.iter().all(|a| !blocked.contains(a)));

    let probed_before = prober.probed().len();
    let summary = second.run().unwrap();
    assert_eq!(summary.iterations, 3);
    assert!(prober.probed()[probed_before..]
        .iter()
        .all(|a| !blocked.contains(a)));

    let saved = store(fx.path()).load().unwrap().unwrap();
    assert_eq!(saved.blacklist_fingerprint, blocked.fingerprint());
}

#[test]
fn cancellation_stops_before_new_work() {
    let fx = Fixture::new();
    let prober = ScriptedProber::documentation_net();
    let mut machine = fx.machine(&prober, BlacklistRegistry::empty(), capped(0));

    step_until(&mut machine, |m| m.state().phase == Phase::Train);
    fx.cancel.store(true, Ordering::SeqCst);
    let summary = machine.run().unwrap();

    assert_eq!(summary.stop_reason, Some(StopReason::Cancelled));
    assert_eq!(machine.trace().last(), Some(&Phase::Train));
    assert_eq!(summary.iterations, 0);

    fx.cancel.store(false, Ordering::SeqCst);
    let summary = fx
        .machine(&prober, BlacklistRegistry::empty(), capped(1))
        .run()
        .unwrap();
    assert_eq!(summary.iterations, 1);
}

#[test]
fn cancellation_still_commits_pending_hits() {
    let fx = Fixture::new();
    let prober = ScriptedProber::documentation_net();
    let mut machine = fx.machine(&prober, BlacklistRegistry::empty(), capped(0));

    step_until(&mut machine, |m| {
        m.state().phase == Phase::Merge && m.trace().contains(&Phase::Scan)
    });
    fx.cancel.store(true, Ordering::SeqCst);
    let summary = machine.run().unwrap();

    let tail = &machine.trace()[machine.trace().len() - 2..];
    assert_eq!(tail, &[Phase::Merge, Phase::Checkpoint]);
    assert_eq!(summary.iterations, 1);
    assert_eq!(summary.stop_reason, Some(StopReason::Cancelled));

    let saved = store(fx.path()).load().unwrap().unwrap();
    assert_eq!(saved.state.stop_reason, Some(StopReason::Cancelled));
    assert_eq!(saved.corpus.records, 82);

    // A cancelled run resumes normally.
    fx.cancel.store(false, Ordering::SeqCst);
    let mut resumed = fx.machine(&prober, BlacklistRegistry::empty(), capped(2));
    assert_eq!(resumed.step().unwrap(), Phase::Train);
    assert_eq!(resumed.run().unwrap().iterations, 2);
}

#[test]
fn scan_abort_rolls_back_to_checkpoint() {
    let fx = Fixture::new();
    let prober = ScriptedProber::documentation_net();
    let mut machine = fx.machine(&prober, BlacklistRegistry::empty(), capped(1));

    step_until(&mut machine, |m| m.state().phase == Phase::Scan);
    assert_eq!(machine.state().total_candidates, 50);
    prober.fail_next([ProbeError::Fatal("interface down".into())]);

    assert_eq!(machine.step().unwrap(), Phase::Train);
    assert_eq!(machine.state().total_candidates, 0);
    assert_eq!(machine.state().iteration, 0);

    let summary = machine.run().unwrap();
    assert_eq!(summary.iterations, 1);
    assert_eq!(summary.total_candidates, 50);
}

#[test]
fn repeated_scan_aborts_leave_checkpoint_untouched() {
    let fx = Fixture::new();
    let prober = ScriptedProber::documentation_net();
    let mut machine = fx.machine(&prober, BlacklistRegistry::empty(), capped(0));

    step_until(&mut machine, |m| m.state().phase == Phase::Scan);
    let state_path = fx.path().join("state.json");
    let before = fs::read(&state_path).unwrap();
    prober.fail_next((0..3).map(|_| ProbeError::Fatal("boom".into())));

    let err = machine.run().unwrap_err();
    assert!(matches!(err, PipelineError::ScanExhausted(3)));
    assert!(!err.is_fatal());
    assert_eq!(fs::read(&state_path).unwrap(), before);
}

#[test]
fn missing_corpus_records_are_fatal() {
    let fx = Fixture::new();
    let prober = ScriptedProber::documentation_net();
    fx.machine(&prober, BlacklistRegistry::empty(), capped(1))
        .run()
        .unwrap();

    store(fx.path()).corpus_log().truncate_to(1).unwrap();

    let mut machine = fx.machine(&prober, BlacklistRegistry::empty(), capped(2));
    let err = machine.step().unwrap_err();
    assert!(matches!(err, PipelineError::Persistence(_)));
    assert!(err.is_fatal());
    assert_eq!(machine.state().phase, Phase::Terminal);
}

#[test]
fn torn_corpus_record_is_dropped() {
    let fx = Fixture::new();
    let prober = ScriptedProber::documentation_net();
    fx.machine(&prober, BlacklistRegistry::empty(), capped(1))
        .run()
        .unwrap();

    let corpus_path = fx.path().join("corpus.bin");
    let mut file = OpenOptions::new().append(true).open(&corpus_path).unwrap();
    file.write_all(&[0x20, 0x01, 0x0d, 0xb8, 0, 0, 0]).unwrap();
    drop(file);

    let mut machine = fx.machine(&prober, BlacklistRegistry::empty(), capped(2));
    assert_eq!(machine.step().unwrap(), Phase::Train);
    assert_eq!(fs::metadata(&corpus_path).unwrap().len(), 82 * 16);
    assert_eq!(machine.run().unwrap().iterations, 2);
}

#[test]
fn blacklisted_seeds_are_never_probed() {
    let fx = Fixture::new();
    let prober = ScriptedProber::documentation_net();
    let blocked = BlacklistRegistry::parse("2001:db8:0:2::/64\n2001:db8:0:3::1").unwrap();
    fx.machine(&prober, blocked.clone(), capped(1))
        .run()
        .unwrap();

    let probed = prober.probed();
    assert!(!probed.contains(&addr("2001:db8:0:3::1")));
    assert!(probed.iter().all(|a| !blocked.contains(a)));
}
