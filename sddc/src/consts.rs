//! FX3 vendor requests, GPIO bits, tuner argument ids and model numbers.

/// USB vendor ID of the Cypress FX3 streamer firmware.
pub const FX3_USB_VID: u16 = 0x04b4;
/// USB product ID of the FX3 once the SDDC firmware is running.
pub const FX3_STREAMER_PID: u16 = 0x00f1;
/// Bulk IN endpoint carrying ADC samples.
pub const RX_ENDPOINT_ADDRESS: u8 = 0x81;

/// Firmware major version this crate speaks to.
pub const FIRMWARE_VER_MAJOR: u8 = 2;
/// Oldest compatible firmware minor version.
pub const FIRMWARE_VER_MINOR: u8 = 1;

/// Default ADC sampling clock.
pub const DEFAULT_ADC_FREQ: u32 = 64_000_000;
/// Highest ADC clock the boards are specified for.
pub const MAX_ADC_FREQ: u32 = 140_000_000;
/// Lowest ADC clock the clock generator can produce.
pub const MIN_ADC_FREQ: u32 = 8_000_000;

/// Reference crystal of the R820T/R828D tuners.
pub const R82XX_REF_FREQ: u32 = 16_000_000;
/// IF the R8xx tuners place the selected channel on.
pub const R82XX_IF_CARRIER: u32 = 4_570_000;

/// Full-scale normalization factors per board family.
pub const BBRF103_GAINFACTOR: f32 = 7.8e-8;
pub const RX888_GAINFACTOR: f32 = 0.695e-8;
pub const RX888MK2_GAINFACTOR: f32 = 1.08e-8;
pub const HF103_GAINFACTOR: f32 = 1.14e-8;

/// Vendor control requests understood by the SDDC FX3 firmware.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fx3Command {
    StartFx3 = 0xAA,
    StopFx3 = 0xAB,
    TestFx3 = 0xAC,
    GpioFx3 = 0xAD,
    I2cWriteFx3 = 0xAE,
    I2cReadFx3 = 0xAF,
    ResetFx3 = 0xB1,
    StartAdc = 0xB2,
    GetStats = 0xB3,
    TunerInit = 0xB4,
    TunerTune = 0xB5,
    SetArgFx3 = 0xB6,
    TunerStandby = 0xB8,
    ReadInfoDebug = 0xBA,
}

/// Argument ids for [`Fx3Command::SetArgFx3`].
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgId {
    R82xxAttenuator = 1,
    R82xxVga = 2,
    R82xxSideband = 3,
    R82xxHarmonic = 4,
    Dat31Att = 10,
    Ad8370Vga = 11,
    Preselector = 12,
    VhfAttenuator = 13,
}

/// GPIO bits driven through [`Fx3Command::GpioFx3`].
pub mod gpio {
    pub const SHDWN: u32 = 0x20;
    pub const DITH: u32 = 0x40;
    pub const RANDO: u32 = 0x80;
    pub const BIAS_HF: u32 = 0x100;
    pub const BIAS_VHF: u32 = 0x200;
    pub const LED_YELLOW: u32 = 0x400;
    pub const LED_RED: u32 = 0x800;
    pub const LED_BLUE: u32 = 0x1000;
    pub const ATT_SEL0: u32 = 0x2000;
    pub const ATT_SEL1: u32 = 0x4000;
    pub const VHF_EN: u32 = 0x8000;
    pub const PGA_EN: u32 = 0x10000;
}
