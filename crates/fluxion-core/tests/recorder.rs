// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of FluxION.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Event recorder lifecycle and live event handling

mod common;

use chrono::TimeDelta;
use common::{
    Harness, bounded, energy_state, eventually, hub_state, power_state, stat_row, state_changed,
    t0,
};
use fluxion_core::{
    EntityRegistry, EventOutcome, EventRecorder, RecorderConfig, RecorderError, TransformSkip,
};
use fluxion_types::{EnergyStatistic, EntityRecord, StatPeriod, SyncKind};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::time::Duration;

fn recorder(harness: &Harness) -> EventRecorder {
    EventRecorder::new(harness.services.clone(), RecorderConfig::default())
}

/// Make the store look populated so `start` skips seeding
fn populate_sink(harness: &Harness) {
    harness.sink.preload_stats(vec![EnergyStatistic::from_row(
        "sensor.existing",
        StatPeriod::Hour,
        &stat_row(t0() - TimeDelta::hours(1), 1.0),
    )]);
}

// ============= Live events =============

#[tokio::test]
async fn test_energy_event_is_written_and_counted() {
    let harness = Harness::new();
    let recorder = recorder(&harness);

    let event = state_changed(
        Some(power_state("sensor.grid_power", "1200")),
        power_state("sensor.grid_power", "1520"),
    );
    assert_eq!(recorder.on_event(event).await, EventOutcome::Recorded);
    recorder.wait_for_side_updates().await;

    let readings = harness.sink.readings();
    assert_eq!(readings.len(), 1);
    assert_eq!(readings[0].entity_id, "sensor.grid_power");
    assert!((readings[0].state - 1520.0).abs() < f64::EPSILON);
    assert_eq!(readings[0].previous_state, Some(1200.0));
    assert_eq!(readings[0].timestamp, t0());

    let snapshot = recorder.get_state();
    assert_eq!(snapshot.event_count, 1);
    assert_eq!(snapshot.last_event_at, Some(t0()));

    // First sighting creates a tracked record
    let record = harness.registry.entity("sensor.grid_power").unwrap();
    assert!(record.tracked);
    assert_eq!(record.event_count, 1);
    assert_eq!(recorder.tracked_entities(), vec!["sensor.grid_power"]);
}

#[tokio::test]
async fn test_known_entity_counter_is_incremented() {
    let harness = Harness::new();
    let recorder = recorder(&harness);

    for value in ["10.5", "10.7", "11.0"] {
        let outcome = recorder
            .on_event(state_changed(None, energy_state("sensor.house_total", value)))
            .await;
        assert_eq!(outcome, EventOutcome::Recorded);
        recorder.wait_for_side_updates().await;
    }

    let record = harness.registry.entity("sensor.house_total").unwrap();
    assert_eq!(record.event_count, 3);
    assert_eq!(record.last_state.as_deref(), Some("11.0"));
    assert_eq!(harness.registry.entity_count(), 1);
}

#[tokio::test]
async fn test_non_numeric_state_never_writes() {
    let harness = Harness::new();
    let recorder = recorder(&harness);

    for state in ["unavailable", "unknown", "", "NaN", "inf"] {
        let outcome = recorder
            .on_event(state_changed(None, power_state("sensor.grid_power", state)))
            .await;
        assert!(
            matches!(outcome, EventOutcome::Skipped(TransformSkip::NonNumeric { .. })),
            "state {state:?} gave {outcome:?}"
        );
    }

    assert_eq!(harness.sink.reading_writes.load(Ordering::SeqCst), 0);
    assert_eq!(recorder.get_state().event_count, 0);
    assert_eq!(harness.registry.entity_count(), 0);
}

#[tokio::test]
async fn test_non_energy_entity_is_discarded() {
    let harness = Harness::new();
    let recorder = recorder(&harness);

    let temperature = hub_state(
        "sensor.living_room",
        "21.5",
        json!({"device_class": "temperature", "unit_of_measurement": "°C"}),
    );
    let outcome = recorder.on_event(state_changed(None, temperature)).await;

    assert_eq!(
        outcome,
        EventOutcome::Skipped(TransformSkip::NotEnergy {
            entity_id: "sensor.living_room".to_owned()
        })
    );
    assert_eq!(harness.sink.reading_writes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_energy_unit_without_device_class_is_recorded() {
    let harness = Harness::new();
    let recorder = recorder(&harness);

    let meter = hub_state(
        "sensor.pv_energy",
        "42.1",
        json!({"unit_of_measurement": "Wh"}),
    );
    assert_eq!(
        recorder.on_event(state_changed(None, meter)).await,
        EventOutcome::Recorded
    );
}

#[tokio::test]
async fn test_write_failure_counts_error_and_skips_registry() {
    let harness = Harness::new();
    let recorder = recorder(&harness);
    harness.sink.fail_write_readings.store(true, Ordering::SeqCst);

    let outcome = recorder
        .on_event(state_changed(None, power_state("sensor.grid_power", "900")))
        .await;
    recorder.wait_for_side_updates().await;

    assert_eq!(outcome, EventOutcome::WriteFailed);
    let snapshot = recorder.get_state();
    assert_eq!(snapshot.error_count, 1);
    assert_eq!(snapshot.event_count, 0);
    assert_eq!(harness.registry.entity_count(), 0);
}

#[tokio::test]
async fn test_registry_failure_does_not_affect_the_write() {
    let harness = Harness::new();
    let recorder = recorder(&harness);
    harness.registry.fail_increment.store(true, Ordering::SeqCst);

    let outcome = recorder
        .on_event(state_changed(None, power_state("sensor.grid_power", "900")))
        .await;
    recorder.wait_for_side_updates().await;

    assert_eq!(outcome, EventOutcome::Recorded);
    assert_eq!(harness.sink.readings().len(), 1);
    let snapshot = recorder.get_state();
    assert_eq!(snapshot.event_count, 1);
    assert_eq!(snapshot.detached_failures, 1);
}

#[tokio::test]
async fn test_auto_track_disabled_keeps_new_entities_untracked() {
    let harness = Harness::new();
    let config = RecorderConfig {
        auto_track_new_entities: false,
        ..RecorderConfig::default()
    };
    let recorder = EventRecorder::new(harness.services.clone(), config);

    recorder
        .on_event(state_changed(None, power_state("sensor.battery_power", "-300")))
        .await;
    recorder.wait_for_side_updates().await;

    let record = harness.registry.entity("sensor.battery_power").unwrap();
    assert!(!record.tracked);
    assert!(recorder.tracked_entities().is_empty());
}

// ============= Lifecycle =============

#[tokio::test]
async fn test_cold_start_seeds_once_and_logs_combined_count() {
    let harness = Harness::new();
    harness.hub.set_states(vec![
        power_state("sensor.grid_power", "1500"),
        energy_state("sensor.house_total", "120.4"),
        hub_state("light.kitchen", "on", json!({})),
    ]);
    let hour = |h| t0() - TimeDelta::hours(h);
    harness.hub.set_stats(
        "sensor.grid_power",
        vec![stat_row(hour(3), 1.0), stat_row(hour(2), 2.0)],
    );
    harness.hub.set_stats(
        "sensor.house_total",
        vec![
            stat_row(hour(3), 100.0),
            stat_row(hour(2), 101.0),
            stat_row(hour(1), 102.0),
        ],
    );

    let recorder = recorder(&harness);
    bounded(recorder.start()).await.unwrap();

    // One statistics request covering both entities over the seed window
    let calls = harness.hub.stats_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(
        calls[0].entity_ids,
        vec!["sensor.grid_power", "sensor.house_total"]
    );
    assert_eq!(calls[0].start, t0() - TimeDelta::days(30));
    assert_eq!(calls[0].end, t0());
    assert_eq!(calls[0].period, StatPeriod::Hour);

    let batches = harness.sink.stats_batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 5);

    let log = harness.registry.sync_log();
    assert_eq!(log.len(), 1);
    assert!(log[0].success);
    assert_eq!(log[0].kind, SyncKind::Seed);
    assert_eq!(log[0].records_synced, 5);
    assert_eq!(
        log[0].entity_ids,
        vec!["sensor.grid_power", "sensor.house_total"]
    );

    assert!(harness.registry.entity("light.kitchen").is_none());
    assert_eq!(
        recorder.tracked_entities(),
        vec!["sensor.grid_power", "sensor.house_total"]
    );

    let snapshot = recorder.get_state();
    assert!(snapshot.is_running);
    assert_eq!(snapshot.entity_count, 2);
    assert_eq!(snapshot.subscribed_at, Some(t0()));
    assert_eq!(harness.hub.active_subscriptions(), 1);

    bounded(recorder.stop()).await;
}

#[tokio::test]
async fn test_populated_store_skips_seeding() {
    let harness = Harness::new();
    populate_sink(&harness);
    harness
        .hub
        .set_states(vec![power_state("sensor.grid_power", "1500")]);

    let recorder = recorder(&harness);
    bounded(recorder.start()).await.unwrap();

    assert!(harness.hub.stats_calls().is_empty());
    assert!(harness.registry.sync_log().is_empty());
    bounded(recorder.stop()).await;
}

#[tokio::test]
async fn test_start_loads_tracked_entities_from_registry() {
    let harness = Harness::new();
    populate_sink(&harness);
    let mut record =
        EntityRecord::from_hub_state(&power_state("sensor.solar_power", "0"), true, t0());
    record.event_count = 12;
    harness.registry.upsert_entity(&record).await.unwrap();

    let recorder = recorder(&harness);
    bounded(recorder.start()).await.unwrap();

    assert_eq!(recorder.tracked_entities(), vec!["sensor.solar_power"]);
    bounded(recorder.stop()).await;
}

#[tokio::test]
async fn test_subscription_failure_does_not_block_start() {
    let harness = Harness::new();
    populate_sink(&harness);
    harness.hub.fail_subscribe.store(true, Ordering::SeqCst);

    let recorder = recorder(&harness);
    bounded(recorder.start()).await.unwrap();

    let snapshot = recorder.get_state();
    assert!(snapshot.is_running);
    assert_eq!(snapshot.error_count, 1);
    assert_eq!(snapshot.subscribed_at, None);

    let persisted = harness.registry.subscription_state().unwrap();
    assert!(!persisted.active);
    bounded(recorder.stop()).await;
}

#[tokio::test]
async fn test_pushed_events_flow_through_the_pump() {
    let harness = Harness::new();
    populate_sink(&harness);
    let recorder = recorder(&harness);
    bounded(recorder.start()).await.unwrap();

    harness
        .hub
        .push(state_changed(None, power_state("sensor.grid_power", "100")));
    harness
        .hub
        .push(state_changed(None, power_state("sensor.grid_power", "unavailable")));
    harness
        .hub
        .push(state_changed(None, power_state("sensor.grid_power", "150")));

    let sink = harness.sink.clone();
    eventually(move || sink.readings().len() == 2).await;

    let states: Vec<f64> = harness.sink.readings().iter().map(|r| r.state).collect();
    assert_eq!(states, vec![100.0, 150.0]);

    bounded(recorder.stop()).await;
    assert_eq!(recorder.get_state().event_count, 2);
}

#[tokio::test]
async fn test_stop_is_idempotent_and_final() {
    let harness = Harness::new();
    populate_sink(&harness);
    let recorder = recorder(&harness);
    bounded(recorder.start()).await.unwrap();

    bounded(recorder.stop()).await;
    bounded(recorder.stop()).await;

    let snapshot = recorder.get_state();
    assert!(!snapshot.is_running);
    assert_eq!(harness.hub.known_subscriptions(), 0);

    let persisted = harness.registry.subscription_state().unwrap();
    assert!(!persisted.active);

    // Nothing is accepted once stopped
    assert!(matches!(
        recorder.start().await,
        Err(RecorderError::ShuttingDown)
    ));
    assert_eq!(
        recorder
            .on_event(state_changed(None, power_state("sensor.grid_power", "1")))
            .await,
        EventOutcome::ShuttingDown
    );
    assert!(matches!(
        recorder.trigger_backfill().await,
        Err(RecorderError::ShuttingDown)
    ));
    assert_eq!(harness.sink.reading_writes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_stop_before_start() {
    let harness = Harness::new();
    let recorder = recorder(&harness);

    bounded(recorder.stop()).await;

    assert!(!recorder.get_state().is_running);
    assert!(matches!(
        recorder.start().await,
        Err(RecorderError::ShuttingDown)
    ));
}

#[tokio::test]
async fn test_second_start_is_a_no_op() {
    let harness = Harness::new();
    populate_sink(&harness);
    let recorder = recorder(&harness);

    bounded(recorder.start()).await.unwrap();
    bounded(recorder.start()).await.unwrap();

    assert_eq!(harness.hub.subscribe_calls.load(Ordering::SeqCst), 1);
    bounded(recorder.stop()).await;
}

#[tokio::test]
async fn test_reconnect_restores_subscription_before_heartbeat() {
    let harness = Harness::new();
    populate_sink(&harness);
    let recorder = recorder(&harness);
    bounded(recorder.start()).await.unwrap();
    assert_eq!(harness.hub.active_subscriptions(), 1);

    // The session reconnects by itself; the heartbeat is minutes away
    harness.hub.cycle_connection();
    let hub = harness.hub.clone();
    eventually(move || hub.active_subscriptions() == 1).await;
    assert_eq!(harness.hub.subscribe_calls.load(Ordering::SeqCst), 2);
    assert_eq!(harness.hub.known_subscriptions(), 1);
    assert_eq!(harness.hub.reconnect_calls.load(Ordering::SeqCst), 0);

    harness
        .hub
        .push(state_changed(None, power_state("sensor.grid_power", "640")));
    let sink = harness.sink.clone();
    eventually(move || sink.readings().len() == 1).await;
    assert_eq!(recorder.get_state().error_count, 0);

    bounded(recorder.stop()).await;
}

#[tokio::test]
async fn test_stop_waits_for_running_backfill_to_log() {
    let harness = Harness::new();
    populate_sink(&harness);
    let record = EntityRecord::from_hub_state(&power_state("sensor.grid_power", "0"), true, t0());
    harness.registry.upsert_entity(&record).await.unwrap();
    harness.hub.set_stats(
        "sensor.grid_power",
        vec![stat_row(t0() - TimeDelta::hours(1), 4.0)],
    );
    harness.sink.write_stats_gate.arm();

    let recorder = EventRecorder::new(
        harness.services.clone(),
        RecorderConfig {
            backfill_interval: Duration::from_millis(20),
            ..RecorderConfig::default()
        },
    );
    bounded(recorder.start()).await.unwrap();
    bounded(harness.sink.write_stats_gate.entered()).await;

    let stopping = {
        let recorder = recorder.clone();
        tokio::spawn(async move { recorder.stop().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!stopping.is_finished());

    harness.sink.write_stats_gate.open();
    bounded(stopping).await.unwrap();

    let log = harness.registry.sync_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].kind, SyncKind::Backfill);
    assert!(log[0].success);
    assert_eq!(log[0].records_synced, 1);
    assert_eq!(harness.sink.stored_stats("sensor.grid_power").len(), 1);
    assert!(!recorder.get_state().is_running);
}

#[tokio::test]
async fn test_stop_during_seeding_keeps_recorder_offline() {
    let harness = Harness::new();
    harness
        .hub
        .set_states(vec![power_state("sensor.grid_power", "1500")]);
    harness.hub.stats_gate.arm();
    let recorder = recorder(&harness);

    let starting = {
        let recorder = recorder.clone();
        tokio::spawn(async move { recorder.start().await })
    };
    bounded(harness.hub.stats_gate.entered()).await;

    let stopping = {
        let recorder = recorder.clone();
        tokio::spawn(async move { recorder.stop().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    harness.hub.stats_gate.open();

    let started = bounded(starting).await.unwrap();
    assert!(matches!(started, Err(RecorderError::ShuttingDown)));
    bounded(stopping).await.unwrap();

    assert_eq!(harness.hub.subscribe_calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.hub.known_subscriptions(), 0);
    assert!(!recorder.get_state().is_running);
    assert!(!harness.registry.subscription_state().unwrap().active);
}

// ============= Manual triggers =============

#[tokio::test]
async fn test_second_trigger_within_window_is_rate_limited() {
    let harness = Harness::new();
    let recorder = recorder(&harness);

    recorder.trigger_backfill().await.unwrap();
    harness.clock.advance(TimeDelta::seconds(10));

    match recorder.trigger_backfill().await {
        Err(RecorderError::RateLimited { retry_after_ms }) => {
            assert_eq!(retry_after_ms, 20_000);
        }
        other => panic!("expected rate limit, got {other:?}"),
    }

    // Keys are limited independently
    recorder.rediscover_entities().await.unwrap();

    harness.clock.advance(TimeDelta::seconds(20));
    recorder.trigger_backfill().await.unwrap();
}

#[tokio::test]
async fn test_check_rate_limit_reports_retry() {
    let harness = Harness::new();
    let recorder = recorder(&harness);

    assert!(recorder.check_rate_limit("export").allowed);
    let decision = recorder.check_rate_limit("export");
    assert!(!decision.allowed);
    assert!(decision.retry_after_ms > 0 && decision.retry_after_ms <= 30_000);
}

#[tokio::test]
async fn test_set_entity_tracked_updates_memory_and_registry() {
    let harness = Harness::new();
    harness.hub.set_states(vec![
        power_state("sensor.grid_power", "1"),
        power_state("sensor.solar_power", "2"),
    ]);
    let recorder = recorder(&harness);
    recorder.rediscover_entities().await.unwrap();
    assert_eq!(recorder.tracked_entities().len(), 2);

    assert!(recorder
        .set_entity_tracked("sensor.solar_power", false)
        .await
        .unwrap());
    assert_eq!(recorder.tracked_entities(), vec!["sensor.grid_power"]);
    assert!(!harness.registry.entity("sensor.solar_power").unwrap().tracked);

    assert!(!recorder
        .set_entity_tracked("sensor.unknown", true)
        .await
        .unwrap());
    assert_eq!(recorder.tracked_entities(), vec!["sensor.grid_power"]);
}

#[tokio::test]
async fn test_rediscovery_failure_is_reported() {
    let harness = Harness::new();
    harness.hub.fail_get_states.store(true, Ordering::SeqCst);
    let recorder = recorder(&harness);

    let err = recorder.rediscover_entities().await.unwrap_err();
    assert!(matches!(err, RecorderError::Hub(_)));
    assert_eq!(recorder.get_state().error_count, 1);
}
