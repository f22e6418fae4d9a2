//! Request message assembly.
//!
//! `MessageBuilder` turns a therapy intent into a typed request: an opcode
//! plus whatever parameters that opcode carries. The radio codec (out of
//! scope) is the thing that actually serializes this onto the air.

use chrono::{DateTime, Utc};
use pod_common::Units;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Beep {
    BipBeepFourTimes,
    Silent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertRepeat {
    OnceEveryFiveMinutes,
    OnceEveryMinuteForFifteenMinutes,
}

#[derive(Debug, Clone, Copy)]
pub struct AlertSlot {
    pub activate: bool,
    pub alert_index: u8,
    pub alert_after_minutes: u32,
    pub alert_duration: u32,
    pub trigger_auto_off: bool,
    pub beep: Beep,
    pub repeat: AlertRepeat,
}

impl AlertSlot {
    /// A deactivated slot at the given index (used to clear the purge alert).
    pub fn deactivated(alert_index: u8) -> Self {
        Self {
            activate: false,
            alert_index,
            alert_after_minutes: 0,
            alert_duration: 0,
            trigger_auto_off: false,
            beep: Beep::Silent,
            repeat: AlertRepeat::OnceEveryFiveMinutes,
        }
    }
}

/// Pod-local calendar time, as the wire format decomposes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PodDateTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl PodDateTime {
    /// Decompose a UTC instant plus a local offset into pod calendar fields.
    pub fn from_utc(instant: DateTime<Utc>, utc_offset_minutes: i32) -> Self {
        use chrono::{Datelike, Timelike};
        let local = instant + chrono::Duration::minutes(utc_offset_minutes as i64);
        Self {
            year: local.year() as u16,
            month: local.month() as u8,
            day: local.day() as u8,
            hour: local.hour() as u8,
            minute: local.minute() as u8,
            second: local.second() as u8,
        }
    }
}

/// The request opcode and its typed parameters.
#[derive(Debug, Clone)]
pub enum RequestBody {
    AssignAddress {
        radio_address: u32,
    },
    SetupPod {
        lot: u32,
        serial: u32,
        radio_address: u32,
        pod_date: PodDateTime,
    },
    AlertSetup {
        slots: Vec<AlertSlotSnapshot>,
    },
    DeliveryFlags {
        a: u8,
        b: u8,
    },
    PrimeCannula,
    InsertCannula,
    BasalSchedule {
        entries: Vec<Units>,
        pod_date: PodDateTime,
    },
    Status {
        kind: StatusRequestKind,
    },
    AcknowledgeAlerts {
        mask: u8,
    },
    TempBasal {
        rate: Units,
        hours: f32,
    },
    CancelTempBasal,
    Bolus {
        amount: Units,
    },
    CancelBolus,
    Deactivate,
}

#[derive(Debug, Clone, Copy)]
pub struct AlertSlotSnapshot {
    pub activate: bool,
    pub alert_index: u8,
    pub alert_after_minutes: u32,
    pub alert_duration: u32,
    pub trigger_auto_off: bool,
    pub beep: Beep,
    pub repeat: AlertRepeat,
}

impl From<AlertSlot> for AlertSlotSnapshot {
    fn from(s: AlertSlot) -> Self {
        Self {
            activate: s.activate,
            alert_index: s.alert_index,
            alert_after_minutes: s.alert_after_minutes,
            alert_duration: s.alert_duration,
            trigger_auto_off: s.trigger_auto_off,
            beep: s.beep,
            repeat: s.repeat,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusRequestKind {
    Standard,
}

/// A fully assembled request message, ready to hand to a `MessageExchange`.
#[derive(Debug, Clone)]
pub struct RequestMessage {
    pub body: RequestBody,
}

/// Fluent assembler turning a therapy intent into a `RequestMessage`.
#[derive(Debug, Default)]
pub struct MessageBuilder;

impl MessageBuilder {
    pub fn new() -> Self {
        Self
    }

    pub fn assign_address(self, radio_address: u32) -> RequestMessage {
        RequestMessage {
            body: RequestBody::AssignAddress { radio_address },
        }
    }

    pub fn setup_pod(self, lot: u32, serial: u32, radio_address: u32, pod_date: PodDateTime) -> RequestMessage {
        RequestMessage {
            body: RequestBody::SetupPod {
                lot,
                serial,
                radio_address,
                pod_date,
            },
        }
    }

    pub fn alert_setup(self, slots: Vec<AlertSlot>) -> RequestMessage {
        RequestMessage {
            body: RequestBody::AlertSetup {
                slots: slots.into_iter().map(AlertSlotSnapshot::from).collect(),
            },
        }
    }

    pub fn delivery_flags(self, a: u8, b: u8) -> RequestMessage {
        RequestMessage {
            body: RequestBody::DeliveryFlags { a, b },
        }
    }

    pub fn prime_cannula(self) -> RequestMessage {
        RequestMessage {
            body: RequestBody::PrimeCannula,
        }
    }

    pub fn insert_cannula(self) -> RequestMessage {
        RequestMessage {
            body: RequestBody::InsertCannula,
        }
    }

    pub fn basal_schedule(self, entries: Vec<Units>, pod_date: PodDateTime) -> RequestMessage {
        RequestMessage {
            body: RequestBody::BasalSchedule { entries, pod_date },
        }
    }

    pub fn status(self, kind: StatusRequestKind) -> RequestMessage {
        RequestMessage {
            body: RequestBody::Status { kind },
        }
    }

    pub fn acknowledge_alerts(self, mask: u8) -> RequestMessage {
        RequestMessage {
            body: RequestBody::AcknowledgeAlerts { mask },
        }
    }

    pub fn temp_basal(self, rate: Units, hours: f32) -> RequestMessage {
        RequestMessage {
            body: RequestBody::TempBasal { rate, hours },
        }
    }

    pub fn cancel_temp_basal(self) -> RequestMessage {
        RequestMessage {
            body: RequestBody::CancelTempBasal,
        }
    }

    pub fn bolus(self, amount: Units) -> RequestMessage {
        RequestMessage {
            body: RequestBody::Bolus { amount },
        }
    }

    pub fn cancel_bolus(self) -> RequestMessage {
        RequestMessage {
            body: RequestBody::CancelBolus,
        }
    }

    pub fn deactivate(self) -> RequestMessage {
        RequestMessage {
            body: RequestBody::Deactivate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_bolus_request() {
        let amount = Units::from_decimal(0.5).unwrap();
        let req = MessageBuilder::new().bolus(amount);
        match req.body {
            RequestBody::Bolus { amount: a } => assert_eq!(a, amount),
            _ => panic!("wrong body"),
        }
    }

    #[test]
    fn pod_date_decomposes_offset() {
        use chrono::TimeZone;
        let utc = Utc.with_ymd_and_hms(2026, 1, 1, 0, 30, 0).unwrap();
        let pod_date = PodDateTime::from_utc(utc, 60);
        assert_eq!(pod_date.hour, 1);
        assert_eq!(pod_date.minute, 30);
    }
}
