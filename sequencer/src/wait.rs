//! Cancellable suspension points
//!
//! Every await inside a task goes through one of these helpers so that
//! cancellation and timeouts behave the same everywhere.

use crate::device::PropertyUpdate;
use crate::error::WaitError;
use crate::event::Subscription;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

async fn deadline_reached(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending::<()>().await,
    }
}

/// Wait until `matcher` resolves a property update.
///
/// The matcher returns `None` to keep waiting, `Some(Ok(_))` to finish and
/// `Some(Err(_))` to abort (an alert, typically). The subscription must
/// have been created before the command whose result is awaited.
pub async fn wait_for_update<T, F>(
    subscription: &mut Subscription,
    token: &CancellationToken,
    timeout: Option<Duration>,
    what: &str,
    mut matcher: F,
) -> Result<T, WaitError>
where
    F: FnMut(&PropertyUpdate) -> Option<Result<T, WaitError>>,
{
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        let update = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(WaitError::Cancelled),
            _ = deadline_reached(deadline) => {
                return Err(WaitError::Timeout {
                    what: what.to_string(),
                    after: timeout.unwrap_or_default(),
                });
            }
            update = subscription.recv_update() => update.ok_or(WaitError::Closed)?,
        };

        if let Some(result) = matcher(&update) {
            return result;
        }
    }
}

/// Sleep for `duration`, calling `on_tick` with the time left at the start
/// and then every `tick`.
pub async fn delay<F>(duration: Duration, tick: Duration, token: &CancellationToken, mut on_tick: F) -> Result<(), WaitError>
where
    F: FnMut(Duration),
{
    let end = Instant::now() + duration;
    loop {
        let now = Instant::now();
        if now >= end {
            return Ok(());
        }
        let remaining = end - now;
        on_tick(remaining);

        tokio::select! {
            biased;
            _ = token.cancelled() => return Err(WaitError::Cancelled),
            _ = tokio::time::sleep(remaining.min(tick)) => {}
        }
    }
}

/// Plain cancellable sleep
pub async fn sleep(duration: Duration, token: &CancellationToken) -> Result<(), WaitError> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(WaitError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Race a future against cancellation
pub async fn cancellable<F: Future>(token: &CancellationToken, future: F) -> Result<F::Output, WaitError> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(WaitError::Cancelled),
        output = future => Ok(output),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceProperty, FocuserProperty, PropertyState};
    use crate::event::{EventBus, Topic};

    fn position(value: i32, state: PropertyState) -> PropertyUpdate {
        PropertyUpdate::new("focuser", DeviceProperty::Focuser(FocuserProperty::Position(value)), state)
    }

    fn reached(target: i32) -> impl FnMut(&PropertyUpdate) -> Option<Result<i32, WaitError>> {
        move |update| match (&update.property, update.state) {
            (DeviceProperty::Focuser(FocuserProperty::Position(p)), PropertyState::Ok) if *p == target => {
                Some(Ok(*p))
            }
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_wait_matches_update() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe_topic(Topic::Device);
        let token = CancellationToken::new();

        bus.publish_update(position(80, PropertyState::Busy));
        bus.publish_update(position(100, PropertyState::Ok));

        let result = wait_for_update(&mut sub, &token, Some(Duration::from_secs(1)), "focuser", reached(100)).await;
        assert_eq!(result, Ok(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe_topic(Topic::Device);
        let token = CancellationToken::new();

        let result = wait_for_update(&mut sub, &token, Some(Duration::from_secs(30)), "focuser", reached(100)).await;
        assert_eq!(
            result,
            Err(WaitError::Timeout {
                what: "focuser".to_string(),
                after: Duration::from_secs(30)
            })
        );
    }

    #[tokio::test]
    async fn test_wait_cancelled() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe_topic(Topic::Device);
        let token = CancellationToken::new();
        token.cancel();

        let result = wait_for_update(&mut sub, &token, None, "focuser", reached(1)).await;
        assert_eq!(result, Err(WaitError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_ticks() {
        let token = CancellationToken::new();
        let mut ticks = Vec::new();
        delay(Duration::from_millis(2500), Duration::from_secs(1), &token, |left| ticks.push(left.as_millis()))
            .await
            .unwrap();
        assert_eq!(ticks, vec![2500, 1500, 500]);
    }
}
