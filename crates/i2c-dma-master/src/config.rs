/// Bus clock rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Frequency {
    /// 100 kHz standard mode.
    Standard,
    /// 400 kHz fast mode.
    Fast,
}

impl Frequency {
    /// SCL frequency in hertz.
    pub const fn hz(self) -> u32 {
        match self {
            Frequency::Standard => 100_000,
            Frequency::Fast => 400_000,
        }
    }
}

/// Arbitration priority requested for the controller's DMA streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DmaPriority {
    Low,
    Medium,
    High,
    VeryHigh,
}

/// Configuration applied by
/// [`BusController::init`](crate::BusController::init).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    /// Bus clock rate.
    pub frequency: Frequency,
    /// Priority passed along with every DMA request.
    pub dma_priority: DmaPriority,
}

impl Config {
    pub const fn new() -> Self {
        Self {
            frequency: Frequency::Standard,
            dma_priority: DmaPriority::High,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}
