use anyhow::Context;
use bluest::{Adapter, AdapterEvent};
use futures_util::StreamExt;

use crate::radio::{PowerState, RadioEvents, RadioPower};

/// Follow the default Bluetooth adapter's power state.
///
/// Keeps `power` current and reports every change through `events`. Returns
/// once the adapter stops reporting, or straight away when there is no adapter.
pub async fn watch_adapter(power: RadioPower, events: RadioEvents) -> anyhow::Result<()> {
    let Some(adapter) = Adapter::default().await else {
        log::warn!("Default adapter not found");
        power.set(PowerState::Absent);
        return Ok(());
    };

    let available = adapter.is_available().await.context("querying adapter state")?;
    apply(&power, &events, available);

    let mut adapter_events = adapter.events().await.context("subscribing to adapter events")?;
    while let Some(event) = adapter_events.next().await {
        match event {
            Ok(AdapterEvent::Available) => apply(&power, &events, true),
            Ok(AdapterEvent::Unavailable) => apply(&power, &events, false),
            Err(err) => {
                log::warn!("Adapter event error: {err}");
                return Err(err.into());
            }
        }
    }

    log::debug!("End of adapter event stream");
    Ok(())
}

fn apply(power: &RadioPower, events: &RadioEvents, on: bool) {
    let state = if on { PowerState::On } else { PowerState::Off };
    if power.get() == state {
        return;
    }
    log::info!("Bluetooth adapter {}", if on { "on" } else { "off" });
    power.set(state);
    events.power_changed(on);
}

#[test]
fn test_apply_reports_changes_only() {
    use crate::worker::Message;
    use tokio::sync::mpsc;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let events = RadioEvents::new(tx);
    let power = RadioPower::new(PowerState::On);

    apply(&power, &events, true);
    assert!(rx.try_recv().is_err());

    apply(&power, &events, false);
    assert_eq!(power.get(), PowerState::Off);
    assert!(matches!(rx.try_recv(), Ok(Message::Radio(crate::radio::RadioEvent::PowerChanged { on: false }))));

    apply(&power, &events, true);
    assert_eq!(power.get(), PowerState::On);
    assert!(matches!(rx.try_recv(), Ok(Message::Radio(crate::radio::RadioEvent::PowerChanged { on: true }))));
}
