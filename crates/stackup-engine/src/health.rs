use stackup_core::{ComponentSpec, ProbeSettings};
use std::thread;
use std::time::Instant;

/// One observation from a component's readiness endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSignal {
    pub ready: bool,
    pub detail: String,
}

impl ProbeSignal {
    pub fn ready(detail: impl Into<String>) -> Self {
        Self {
            ready: true,
            detail: detail.into(),
        }
    }

    pub fn not_ready(detail: impl Into<String>) -> Self {
        Self {
            ready: false,
            detail: detail.into(),
        }
    }
}

pub trait ReadinessProbe {
    /// Never fails: transport errors are reported as a not-ready signal.
    fn poll(&self, component: &ComponentSpec) -> ProbeSignal;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthVerdict {
    pub healthy: bool,
    pub polls: u32,
    pub last_signal: Option<ProbeSignal>,
}

impl HealthVerdict {
    pub fn signal_detail(&self) -> String {
        self.last_signal
            .as_ref()
            .map(|signal| signal.detail.clone())
            .unwrap_or_else(|| "no readiness signal observed".to_string())
    }
}

/// Polls a readiness probe until it passes enough times in a row or the attempt
/// and time bounds run out.
pub struct HealthProber<'a> {
    probe: &'a dyn ReadinessProbe,
}

impl<'a> HealthProber<'a> {
    pub fn new(probe: &'a dyn ReadinessProbe) -> Self {
        Self { probe }
    }

    /// A single poll, for previews that must not wait out the readiness window.
    pub fn observe(&self, component: &ComponentSpec) -> HealthVerdict {
        let signal = self.probe.poll(component);
        HealthVerdict {
            healthy: signal.ready,
            polls: 1,
            last_signal: Some(signal),
        }
    }

    pub fn check(&self, component: &ComponentSpec, settings: ProbeSettings) -> HealthVerdict {
        let started = Instant::now();
        let max_polls = max_polls(&settings);
        let mut consecutive = 0;
        let mut polls = 0;
        let mut last_signal = None;

        loop {
            let signal = self.probe.poll(component);
            polls += 1;
            if signal.ready {
                consecutive += 1;
            } else {
                consecutive = 0;
            }
            tracing::debug!(
                component = %component.name,
                poll = polls,
                ready = signal.ready,
                detail = %signal.detail,
                "readiness poll"
            );
            last_signal = Some(signal);

            if consecutive >= settings.required_consecutive {
                return HealthVerdict {
                    healthy: true,
                    polls,
                    last_signal,
                };
            }

            let elapsed = started.elapsed();
            if polls >= max_polls || elapsed >= settings.timeout {
                return HealthVerdict {
                    healthy: false,
                    polls,
                    last_signal,
                };
            }
            thread::sleep(settings.interval.min(settings.timeout - elapsed));
        }
    }
}

fn max_polls(settings: &ProbeSettings) -> u32 {
    let required = settings.required_consecutive.max(1);
    if settings.interval.is_zero() {
        return required.saturating_mul(1_000);
    }
    let by_time = settings.timeout.as_millis() / settings.interval.as_millis().max(1) + 1;
    u32::try_from(by_time).unwrap_or(u32::MAX).max(required)
}
