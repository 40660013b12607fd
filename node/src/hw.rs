//! Thin hardware shims behind the capability traits. Real sensor drivers
//! are an external concern; these speak just enough raw I2C / GPIO to
//! satisfy the contracts on the reference board.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use esp_idf_hal::adc::attenuation::DB_11;
use esp_idf_hal::adc::oneshot::config::AdcChannelConfig;
use esp_idf_hal::adc::oneshot::{AdcChannelDriver, AdcDriver};
use esp_idf_hal::adc::ADC1;
use esp_idf_hal::delay::{Ets, BLOCK};
use esp_idf_hal::gpio::{
    AnyIOPin, AnyInputPin, AnyOutputPin, Gpio32, Input, Output, PinDriver,
};
use esp_idf_hal::i2c::I2cDriver;

use greenhouse_common::hal::{Relays, Sensors, StatusLcd};
use greenhouse_common::types::{AirQuality, Relay};

pub const PIN_PUMP: i32 = 26;
pub const PIN_FAN: i32 = 27;
pub const PIN_HEATER: i32 = 14;
pub const PIN_TRIG: i32 = 5;
pub const PIN_ECHO: i32 = 34;
pub const PIN_BUTTON: i32 = 4;

const AHT_ADDR: u8 = 0x38;
const ENS_ADDR: u8 = 0x53;
const LCD_ADDR: u8 = 0x27;

/// Echo wait bound; past this the tank reads as empty.
const ECHO_TIMEOUT_US: i64 = 30_000;

pub type SharedI2c = Arc<Mutex<I2cDriver<'static>>>;

fn now_us() -> i64 {
    unsafe { esp_idf_svc::sys::esp_timer_get_time() }
}

fn i2c_write(i2c: &SharedI2c, addr: u8, bytes: &[u8]) -> Result<()> {
    let mut bus = i2c.lock().unwrap();
    bus.write(addr, bytes, BLOCK)
        .map_err(|err| anyhow!("i2c write to {addr:#04x} failed: {err}"))
}

fn i2c_write_read(i2c: &SharedI2c, addr: u8, register: u8, out: &mut [u8]) -> Result<()> {
    let mut bus = i2c.lock().unwrap();
    bus.write(addr, &[register], BLOCK)
        .map_err(|err| anyhow!("i2c write to {addr:#04x} failed: {err}"))?;
    bus.read(addr, out, BLOCK)
        .map_err(|err| anyhow!("i2c read from {addr:#04x} failed: {err}"))
}

fn i2c_read(i2c: &SharedI2c, addr: u8, out: &mut [u8]) -> Result<()> {
    let mut bus = i2c.lock().unwrap();
    bus.read(addr, out, BLOCK)
        .map_err(|err| anyhow!("i2c read from {addr:#04x} failed: {err}"))
}

/// AHT2x temperature/humidity over raw I2C transactions.
struct Aht {
    i2c: SharedI2c,
}

impl Aht {
    fn init(i2c: SharedI2c) -> Result<Self> {
        // Soft reset, then the calibration-init command.
        i2c_write(&i2c, AHT_ADDR, &[0xBA]).context("AHT reset")?;
        thread::sleep(Duration::from_millis(20));
        i2c_write(&i2c, AHT_ADDR, &[0xBE, 0x08, 0x00]).context("AHT init")?;
        thread::sleep(Duration::from_millis(10));
        Ok(Self { i2c })
    }

    fn read(&mut self) -> Result<(f32, f32)> {
        i2c_write(&self.i2c, AHT_ADDR, &[0xAC, 0x33, 0x00])?;
        thread::sleep(Duration::from_millis(80));

        let mut raw = [0u8; 7];
        i2c_read(&self.i2c, AHT_ADDR, &mut raw)?;
        if raw[0] & 0x80 != 0 {
            bail!("AHT still busy after measurement delay");
        }

        let hum_raw = (u32::from(raw[1]) << 12) | (u32::from(raw[2]) << 4) | (u32::from(raw[3]) >> 4);
        let temp_raw =
            (u32::from(raw[3] & 0x0F) << 16) | (u32::from(raw[4]) << 8) | u32::from(raw[5]);

        let hum_pct = hum_raw as f32 * 100.0 / ((1 << 20) as f32);
        let temp_c = temp_raw as f32 * 200.0 / ((1 << 20) as f32) - 50.0;
        Ok((temp_c, hum_pct))
    }
}

/// ENS160 air quality: standard operating mode, polled for fresh samples.
struct Ens160 {
    i2c: SharedI2c,
}

impl Ens160 {
    const REG_OPMODE: u8 = 0x10;
    const REG_STATUS: u8 = 0x20;
    const REG_TVOC: u8 = 0x22;
    const REG_ECO2: u8 = 0x24;
    const OPMODE_STD: u8 = 0x02;
    const STATUS_NEWDAT: u8 = 0x02;

    fn init(i2c: SharedI2c) -> Result<Self> {
        i2c_write(&i2c, ENS_ADDR, &[Self::REG_OPMODE, Self::OPMODE_STD]).context("ENS opmode")?;
        Ok(Self { i2c })
    }

    fn read_if_fresh(&mut self) -> Result<Option<AirQuality>> {
        let mut status = [0u8; 1];
        i2c_write_read(&self.i2c, ENS_ADDR, Self::REG_STATUS, &mut status)?;
        if status[0] & Self::STATUS_NEWDAT == 0 {
            return Ok(None);
        }

        let mut tvoc = [0u8; 2];
        i2c_write_read(&self.i2c, ENS_ADDR, Self::REG_TVOC, &mut tvoc)?;
        let mut eco2 = [0u8; 2];
        i2c_write_read(&self.i2c, ENS_ADDR, Self::REG_ECO2, &mut eco2)?;

        Ok(Some(AirQuality {
            eco2_ppm: i32::from(u16::from_le_bytes(eco2)),
            tvoc_ppb: i32::from(u16::from_le_bytes(tvoc)),
        }))
    }
}

/// HC-SR04 style ranging with an explicit microsecond timeout.
struct Ultrasonic {
    trig: PinDriver<'static, AnyOutputPin, Output>,
    echo: PinDriver<'static, AnyInputPin, Input>,
}

impl Ultrasonic {
    fn init() -> Result<Self> {
        let trig = PinDriver::output(unsafe { AnyOutputPin::new(PIN_TRIG) })
            .context("trigger pin init")?;
        let echo =
            PinDriver::input(unsafe { AnyInputPin::new(PIN_ECHO) }).context("echo pin init")?;
        Ok(Self { trig, echo })
    }

    fn measure_cm(&mut self) -> Result<f32> {
        self.trig.set_low()?;
        Ets::delay_us(2);
        self.trig.set_high()?;
        Ets::delay_us(10);
        self.trig.set_low()?;

        let armed = now_us();
        while self.echo.is_low() {
            if now_us() - armed > ECHO_TIMEOUT_US {
                bail!("echo never started within {ECHO_TIMEOUT_US}us");
            }
        }

        let rise = now_us();
        while self.echo.is_high() {
            if now_us() - rise > ECHO_TIMEOUT_US {
                bail!("echo never ended within {ECHO_TIMEOUT_US}us");
            }
        }

        let width_us = (now_us() - rise) as f32;
        Ok(width_us * 0.034 / 2.0)
    }
}

/// The full sensor bank behind the `Sensors` contract.
pub struct EspSensors {
    aht: Aht,
    ens: Ens160,
    adc: &'static AdcDriver<'static, ADC1>,
    soil: AdcChannelDriver<'static, Gpio32, &'static AdcDriver<'static, ADC1>>,
    ultrasonic: Ultrasonic,
}

impl EspSensors {
    pub fn init(i2c: SharedI2c, adc1: ADC1, soil_pin: Gpio32) -> Result<Self> {
        // The ADC driver must outlive its channel; the sensor bank itself
        // lives for the whole uptime, so leaking is the simplest ownership.
        let adc: &'static AdcDriver<'static, ADC1> =
            Box::leak(Box::new(AdcDriver::new(adc1).context("adc init")?));
        let config = AdcChannelConfig {
            attenuation: DB_11,
            ..Default::default()
        };
        let soil = AdcChannelDriver::new(adc, soil_pin, &config).context("soil channel init")?;

        Ok(Self {
            aht: Aht::init(i2c.clone()).context("AHT init")?,
            ens: Ens160::init(i2c).context("ENS init")?,
            adc,
            soil,
            ultrasonic: Ultrasonic::init()?,
        })
    }
}

impl Sensors for EspSensors {
    fn read_temp_humidity(&mut self) -> Result<(f32, f32)> {
        self.aht.read()
    }

    fn read_air_quality(&mut self) -> Result<Option<AirQuality>> {
        self.ens.read_if_fresh()
    }

    fn read_soil_raw(&mut self) -> Result<i32> {
        let raw = self.adc.read(&mut self.soil).context("soil adc read")?;
        Ok(i32::from(raw))
    }

    fn measure_distance_cm(&mut self) -> Result<f32> {
        self.ultrasonic.measure_cm()
    }
}

pub struct EspRelays {
    pump: PinDriver<'static, AnyOutputPin, Output>,
    fan: PinDriver<'static, AnyOutputPin, Output>,
    heater: PinDriver<'static, AnyOutputPin, Output>,
}

impl EspRelays {
    /// All outputs driven low (off) before the first control decision.
    pub fn init() -> Result<Self> {
        let mut relays = Self {
            pump: PinDriver::output(unsafe { AnyOutputPin::new(PIN_PUMP) })?,
            fan: PinDriver::output(unsafe { AnyOutputPin::new(PIN_FAN) })?,
            heater: PinDriver::output(unsafe { AnyOutputPin::new(PIN_HEATER) })?,
        };
        for relay in [Relay::Pump, Relay::Fan, Relay::Heater] {
            relays.set_relay(relay, false)?;
        }
        Ok(relays)
    }
}

impl Relays for EspRelays {
    fn set_relay(&mut self, relay: Relay, on: bool) -> Result<()> {
        let pin = match relay {
            Relay::Pump => &mut self.pump,
            Relay::Fan => &mut self.fan,
            Relay::Heater => &mut self.heater,
        };
        if on {
            pin.set_high()?;
        } else {
            pin.set_low()?;
        }
        Ok(())
    }
}

/// 20x4 character panel behind a PCF8574 backpack, 4-bit protocol.
pub struct I2cLcd {
    i2c: SharedI2c,
    backlight: u8,
}

impl I2cLcd {
    const BACKLIGHT: u8 = 0x08;
    const ENABLE: u8 = 0x04;
    const RS_DATA: u8 = 0x01;
    const ROW_OFFSETS: [u8; 4] = [0x00, 0x40, 0x14, 0x54];

    pub fn init(i2c: SharedI2c) -> Result<Self> {
        let mut lcd = Self {
            i2c,
            backlight: Self::BACKLIGHT,
        };

        thread::sleep(Duration::from_millis(50));
        // 8-bit reset sequence, then switch to 4-bit mode.
        for _ in 0..3 {
            lcd.write_nibble(0x30, false)?;
            thread::sleep(Duration::from_millis(5));
        }
        lcd.write_nibble(0x20, false)?;

        lcd.command(0x28)?; // 4-bit, two logical lines, 5x8 font
        lcd.command(0x0C)?; // display on, cursor off
        lcd.command(0x01)?; // clear
        thread::sleep(Duration::from_millis(2));
        lcd.command(0x06)?; // left-to-right entry
        Ok(lcd)
    }

    fn write_nibble(&mut self, value: u8, is_data: bool) -> Result<()> {
        let mut frame = (value & 0xF0) | self.backlight;
        if is_data {
            frame |= Self::RS_DATA;
        }
        i2c_write(&self.i2c, LCD_ADDR, &[frame | Self::ENABLE])?;
        Ets::delay_us(1);
        i2c_write(&self.i2c, LCD_ADDR, &[frame & !Self::ENABLE])?;
        Ets::delay_us(50);
        Ok(())
    }

    fn write_byte(&mut self, value: u8, is_data: bool) -> Result<()> {
        self.write_nibble(value & 0xF0, is_data)?;
        self.write_nibble(value << 4, is_data)
    }

    fn command(&mut self, value: u8) -> Result<()> {
        self.write_byte(value, false)
    }
}

impl StatusLcd for I2cLcd {
    fn lcd_write(&mut self, row: usize, text: &str) -> Result<()> {
        let offset = *Self::ROW_OFFSETS
            .get(row)
            .ok_or_else(|| anyhow!("row {row} out of range"))?;
        self.command(0x80 | offset)?;
        for byte in text.bytes() {
            self.write_byte(byte, true)?;
        }
        Ok(())
    }
}

/// Debounced edge detector for the reconfiguration button. The ISR only
/// records the press; the interface task picks it up on its next tick.
pub struct Button {
    pin: PinDriver<'static, AnyIOPin, Input>,
    pressed: Arc<std::sync::atomic::AtomicBool>,
}

impl Button {
    pub fn init(debounce_ms: u64) -> Result<Self> {
        use esp_idf_hal::gpio::{InterruptType, Pull};
        use std::sync::atomic::{AtomicBool, Ordering};

        let mut pin = PinDriver::input(unsafe { AnyIOPin::new(PIN_BUTTON) })?;
        pin.set_pull(Pull::Up)?;
        pin.set_interrupt_type(InterruptType::NegEdge)?;

        let pressed = Arc::new(AtomicBool::new(false));
        let flag = pressed.clone();
        let mut last_edge_us: i64 = 0;

        unsafe {
            pin.subscribe(move || {
                let now = esp_idf_svc::sys::esp_timer_get_time();
                if now - last_edge_us > (debounce_ms as i64) * 1_000 {
                    flag.store(true, Ordering::Relaxed);
                }
                last_edge_us = now;
            })?;
        }
        pin.enable_interrupt()?;

        Ok(Self { pin, pressed })
    }

    /// Consume one debounced press, re-arming the interrupt.
    pub fn take_press(&mut self) -> bool {
        use std::sync::atomic::Ordering;

        if self.pressed.swap(false, Ordering::Relaxed) {
            let _ = self.pin.enable_interrupt();
            return true;
        }
        false
    }
}
