use std::sync::Arc;
use std::time::Duration;

use dialsync::engine::CapabilitySet;
use dialsync::engine::Channel;
use dialsync::engine::ChannelTarget;
use dialsync::engine::ColorMode;
use dialsync::engine::Engine;
use dialsync::engine::EngineSettings;
use dialsync::engine::EntityId;
use dialsync::engine::EntitySnapshot;
use dialsync::engine::PushChange;
use dialsync::engine::PushUpdate;
use dialsync::engine::SnapshotState;
use dialsync::engine::UiEvent;
use dialsync::integrations::LoopbackHub;

fn lamp() -> EntitySnapshot {
    EntitySnapshot {
        entity_id: EntityId::new("light.lamp"),
        state: SnapshotState {
            on: Some(false),
            brightness: Some(0),
            color_temp_mired: Some(370),
            ..Default::default()
        },
        capabilities: CapabilitySet {
            on_off: true,
            brightness: true,
            color_temp: true,
            ..Default::default()
        },
    }
}

fn strip() -> EntitySnapshot {
    EntitySnapshot {
        entity_id: EntityId::new("light.strip"),
        state: SnapshotState {
            on: Some(true),
            brightness: Some(255),
            hue: Some(0.0),
            saturation: Some(100.0),
            ..Default::default()
        },
        capabilities: CapabilitySet {
            on_off: true,
            brightness: true,
            color_hs: true,
            preferred_color_mode: Some(ColorMode::Rgbw),
            ..Default::default()
        },
    }
}

async fn start(entities: Vec<EntitySnapshot>) -> (Arc<LoopbackHub>, Arc<Engine>) {
    let hub = Arc::new(LoopbackHub::new(entities, Duration::from_millis(100)));
    let engine = Arc::new(Engine::new(hub.clone(), EngineSettings::default()));
    engine.start().await.unwrap();

    tokio::spawn({
        let engine = engine.clone();
        async move { engine.run().await }
    });

    (hub, engine)
}

#[tokio::test(start_paused = true)]
async fn test_echo_does_not_clobber_newer_local_value() {
    let (hub, engine) = start(vec![lamp()]).await;
    let id = EntityId::new("light.lamp");
    engine.enter_context(&id).await;

    for _ in 0..5 {
        engine.apply_tick(&id, Channel::Brightness, 10);
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert_eq!(engine.state(&id).brightness, 128);

    // First dispatch goes out at ~255ms; its echo comes back at ~355ms
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(hub.snapshot(&id).unwrap().state.brightness, Some(128));

    engine.apply_tick(&id, Channel::Brightness, 10);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(engine.state(&id).brightness, 153);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(hub.snapshot(&id).unwrap().state.brightness, Some(153));
    assert_eq!(engine.state(&id).brightness, 153);
    assert_eq!(
        engine.last_sent(&id, Channel::Brightness),
        Some(ChannelTarget::Brightness(153))
    );
}

#[tokio::test(start_paused = true)]
async fn test_external_change_after_window_is_applied() {
    let (hub, engine) = start(vec![lamp()]).await;
    let id = EntityId::new("light.lamp");
    let mut ui = engine.subscribe_ui();
    engine.enter_context(&id).await;

    engine.apply_tick(&id, Channel::Brightness, 20);
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(ui.try_recv().is_err(), "echoes are suppressed silently");

    hub.inject(PushUpdate::new("light.lamp", PushChange::Brightness(Some(30))))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(engine.state(&id).brightness, 30);
    assert_eq!(engine.current_display_value(&id, Channel::Brightness), "12%");
    assert_eq!(
        ui.try_recv().unwrap(),
        UiEvent::ChannelRefreshed {
            entity_id: id.clone(),
            channel: Channel::Brightness,
        }
    );
    assert_eq!(
        ui.try_recv().unwrap(),
        UiEvent::ChannelRefreshed {
            entity_id: id.clone(),
            channel: Channel::Power,
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_disconnected_hub_reports_one_failure() {
    let (hub, engine) = start(vec![lamp()]).await;
    let id = EntityId::new("light.lamp");
    let mut ui = engine.subscribe_ui();
    engine.enter_context(&id).await;

    hub.set_connected(false);
    for _ in 0..3 {
        engine.apply_tick(&id, Channel::ColorTemp, 2);
    }
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(
        ui.try_recv().unwrap(),
        UiEvent::DispatchFailed {
            entity_id: id.clone(),
            channel: Channel::ColorTemp,
            reason: "hub is not connected".to_string(),
        }
    );
    assert!(ui.try_recv().is_err());
    assert_eq!(engine.state(&id).color_temp_mired, 400);
    assert_eq!(hub.snapshot(&id).unwrap().state.color_temp_mired, Some(370));

    // Once back, the next adjustment goes through
    hub.set_connected(true);
    engine.apply_tick(&id, Channel::ColorTemp, -1);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(hub.snapshot(&id).unwrap().state.color_temp_mired, Some(395));
}

#[tokio::test(start_paused = true)]
async fn test_rgbw_color_dispatch() {
    let (hub, engine) = start(vec![strip()]).await;
    let id = EntityId::new("light.strip");
    engine.enter_context(&id).await;
    engine.set_white_levels(&id, None, Some(40));

    engine.apply_tick(&id, Channel::Hue, 30);
    engine.apply_tick(&id, Channel::Hue, 30);
    engine.apply_tick(&id, Channel::Hue, 30);
    engine.apply_tick(&id, Channel::Hue, 30);
    assert_eq!(engine.state(&id).hue, 120.0);
    assert_eq!(engine.current_display_value(&id, Channel::Hue), "120°");

    tokio::time::sleep(Duration::from_millis(500)).await;

    let state = hub.snapshot(&id).unwrap().state;
    assert_eq!(state.hue, Some(120.0));
    assert_eq!(state.saturation, Some(100.0));
    assert_eq!(engine.state(&id).hue, 120.0);
}

#[tokio::test(start_paused = true)]
async fn test_leave_then_reenter_starts_clean() {
    let (hub, engine) = start(vec![lamp(), strip()]).await;
    let lamp_id = EntityId::new("light.lamp");
    let strip_id = EntityId::new("light.strip");

    engine.enter_context(&lamp_id).await;
    engine.apply_tick(&lamp_id, Channel::Brightness, 20);
    engine.leave_context(&lamp_id);
    engine.enter_context(&strip_id).await;

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(hub.snapshot(&lamp_id).unwrap().state.brightness, Some(0));
    assert_eq!(engine.pending(&lamp_id, Channel::Brightness), None);

    // The strip was seeded by the same bulk fetch
    assert!(engine.capabilities(&strip_id).color_hs);
    assert_eq!(engine.focused(), Some(strip_id));
}

#[tokio::test(start_paused = true)]
async fn test_power_toggle_round_trip() {
    let (hub, engine) = start(vec![lamp()]).await;
    let id = EntityId::new("light.lamp");
    engine.enter_context(&id).await;

    engine.toggle_power(&id).await.unwrap();
    assert!(engine.state(&id).is_on);
    assert_eq!(hub.snapshot(&id).unwrap().state.on, Some(true));
    assert_eq!(engine.current_display_value(&id, Channel::Power), "On");

    tokio::time::sleep(Duration::from_secs(4)).await;
    hub.inject(PushUpdate::new("light.lamp", PushChange::Power(Some(false))))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!engine.state(&id).is_on);

    // The wall switch turned it off, so turning on again must not be skipped
    engine.toggle_power(&id).await.unwrap();
    assert_eq!(hub.snapshot(&id).unwrap().state.on, Some(true));
}
