//! Exchange parameters: everything that controls a single radio exchange
//! short of the request body itself.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxPower {
    Normal,
    A3BelowNormal,
}

/// One radio exchange's knobs. Cheap to clone; callers build a fresh one
/// per exchange rather than mutating a shared instance.
#[derive(Debug, Clone)]
pub struct ExchangeParameters {
    pub nonce: u32,
    pub allow_auto_level_adjustment: bool,
    pub address_override: Option<u32>,
    pub ack_address_override: Option<u32>,
    pub transmission_level_override: Option<TxPower>,
    pub message_sequence_override: Option<u8>,
    pub repeat_first_packet: bool,
    pub critical_with_followup_required: bool,
}

impl ExchangeParameters {
    /// `GetStandardParameters`: the default shape every operation starts
    /// from before layering on its own overrides.
    pub fn standard(nonce: u32) -> Self {
        Self {
            nonce,
            allow_auto_level_adjustment: true,
            address_override: None,
            ack_address_override: None,
            transmission_level_override: None,
            message_sequence_override: None,
            repeat_first_packet: false,
            critical_with_followup_required: false,
        }
    }

    /// Swaps in a freshly generated nonce, used when retrying after a
    /// nonce-resync request (spec §4.1.2, §4.2).
    pub fn with_nonce(mut self, nonce: u32) -> Self {
        self.nonce = nonce;
        self
    }

    pub fn with_message_sequence_override(mut self, seq: u8) -> Self {
        self.message_sequence_override = Some(seq % 16);
        self
    }

    pub fn with_address_overrides(mut self, address: u32, ack_address: u32) -> Self {
        self.address_override = Some(address);
        self.ack_address_override = Some(ack_address);
        self
    }

    pub fn with_tx_power(mut self, power: TxPower) -> Self {
        self.transmission_level_override = Some(power);
        self
    }

    pub fn without_auto_level_adjustment(mut self) -> Self {
        self.allow_auto_level_adjustment = false;
        self
    }

    pub fn critical_with_followup(mut self) -> Self {
        self.critical_with_followup_required = true;
        self
    }

    pub fn repeating_first_packet(mut self) -> Self {
        self.repeat_first_packet = true;
        self
    }
}
