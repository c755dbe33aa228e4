//! Simulated sensor for tests and the host-side CLI.
//!
//! Models the parts of the device the session relies on: the bootloader
//! packet protocol and RAM download, application switching, the App0
//! command block, capture/calibration progress, interrupt status and the
//! chip-enable power cycle. The handle is cheap to clone; clones share state,
//! so a test can keep one and give the other to a session.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use byteorder::{ByteOrder, LittleEndian};

use super::traits::{BusError, SensorTransport};
use crate::protocol::constants::*;
use crate::protocol::{AppId, AppVersion, BlCommand, BlPacket, ResultRecord};

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub app0_version: AppVersion,
    pub bootloader_version: u8,
    pub chip_id: u8,
    pub chip_rev: u8,
    /// App0 can be started from ROM by a plain application request.
    pub rom_app0: bool,
    pub has_chip_enable: bool,
    pub has_interrupt_line: bool,
    /// STAT reads reporting "busy" after each power-up.
    pub startup_busy_reads: u32,
    /// App0 state polls until factory calibration completes, `None` to
    /// never complete.
    pub calibration_reads: Option<u32>,
    pub calibration_blob: [u8; FACTORY_CALIB_SIZE],
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            app0_version: AppVersion {
                major: 2,
                minor: 1,
                patch: 7,
            },
            bootloader_version: 1,
            chip_id: 0x07,
            chip_rev: 0x01,
            rom_app0: true,
            has_chip_enable: true,
            has_interrupt_line: true,
            startup_busy_reads: 0,
            calibration_reads: Some(2),
            // crosstalk baseline 1000
            calibration_blob: [0x80, 0x3E, 0x00, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11],
        }
    }
}

struct SimState {
    config: SimConfig,
    regs: [u8; MAX_REGS],
    app: u8,
    enabled: bool,
    standby: bool,
    busy_reads: u32,
    bl_status: u8,
    salt: Option<u8>,
    ram_addr: u16,
    ram: BTreeMap<u16, u8>,
    pending_request: Option<u8>,
    measuring: bool,
    calibrating: bool,
    calibration_remaining: Option<u32>,
    result_number: u8,
    failing: bool,
    writes: Vec<(u8, Vec<u8>)>,
    commands: Vec<u8>,
    bus_ops: u64,
    downloads: u32,
    applied_factory: Option<Vec<u8>>,
}

impl SimState {
    fn new(config: SimConfig) -> Self {
        let mut st = Self {
            config,
            regs: [0; MAX_REGS],
            app: APP_ID_BOOTLOADER,
            enabled: false,
            standby: false,
            busy_reads: 0,
            bl_status: BL_STAT_READY,
            salt: None,
            ram_addr: 0,
            ram: BTreeMap::new(),
            pending_request: None,
            measuring: false,
            calibrating: false,
            calibration_remaining: None,
            result_number: 0,
            failing: false,
            writes: Vec::new(),
            commands: Vec::new(),
            bus_ops: 0,
            downloads: 0,
            applied_factory: None,
        };
        st.power_on();
        st
    }

    fn power_on(&mut self) {
        self.regs = [0; MAX_REGS];
        self.enabled = true;
        self.standby = false;
        self.busy_reads = self.config.startup_busy_reads;
        self.enter_bootloader();
    }

    fn power_off(&mut self) {
        self.enabled = false;
        self.measuring = false;
        self.calibrating = false;
    }

    fn enter_bootloader(&mut self) {
        self.app = APP_ID_BOOTLOADER;
        self.bl_status = BL_STAT_READY;
        self.salt = None;
        self.ram_addr = 0;
        self.ram.clear();
        self.measuring = false;
        self.calibrating = false;
        self.regs[REG_INT_EN as usize] = 0;
        self.regs[REG_INT_STAT as usize] = 0;
    }

    fn enter_app0(&mut self) {
        self.app = APP_ID_APP0;
        self.measuring = false;
        self.calibrating = false;
        for reg in REG_CMD_ALG..=REG_TID {
            self.regs[reg as usize] = 0;
        }
        self.regs[REG_INT_EN as usize] = 0;
        self.regs[REG_INT_STAT as usize] = 0;
    }

    fn in_app0(&self) -> bool {
        self.app == APP_ID_APP0
    }

    fn check_bus(&mut self, reg: u8) -> Result<(), BusError> {
        self.bus_ops += 1;
        if self.failing || !self.enabled {
            return Err(BusError::Nack { reg });
        }
        Ok(())
    }

    fn read_reg(&mut self, addr: u8) -> u8 {
        match addr {
            REG_APP_ID => self.app,
            REG_APP_REV_MAJOR if self.in_app0() => self.config.app0_version.major,
            REG_APP_REV_MAJOR => self.config.bootloader_version,
            REG_STAT => self.stat(),
            REG_CHIP_ID => self.config.chip_id,
            REG_CHIP_REV => self.config.chip_rev,
            REG_BL_CMD_STAT if !self.in_app0() => self.bl_status,
            REG_APP_REV_MINOR if self.in_app0() => self.config.app0_version.minor,
            REG_APP_REV_PATCH if self.in_app0() => self.config.app0_version.patch,
            REG_APP0_STATE if self.in_app0() => self.app0_state(),
            _ => self.regs[addr as usize],
        }
    }

    fn stat(&mut self) -> u8 {
        if self.standby {
            0
        } else if self.busy_reads > 0 {
            self.busy_reads -= 1;
            STAT_PON
        } else {
            STAT_PON | STAT_CPU_READY
        }
    }

    fn app0_state(&mut self) -> u8 {
        if self.calibrating {
            let remaining = self.calibration_remaining;
            match remaining {
                Some(n) if n <= 1 => self.finish_calibration(),
                Some(n) => self.calibration_remaining = Some(n - 1),
                None => {}
            }
        }
        if self.calibrating || self.measuring {
            APP0_STATE_BUSY
        } else {
            0
        }
    }

    fn finish_calibration(&mut self) {
        let start = REG_FACTORY_CALIB as usize;
        self.regs[start..start + FACTORY_CALIB_SIZE].copy_from_slice(&self.config.calibration_blob);
        self.regs[REG_REGISTER_CONTENTS as usize] = CONTENT_CALIBRATION;
        self.calibrating = false;
        self.calibration_remaining = None;
    }

    fn write_reg(&mut self, addr: u8, value: u8) {
        let idx = addr as usize;
        match addr {
            REG_APP_ID | REG_APP_REV_MAJOR | REG_CHIP_ID | REG_CHIP_REV => {}
            REG_REQ_APP_ID => {
                self.regs[idx] = value;
                self.pending_request = Some(value);
            }
            REG_STAT => self.standby = value & STAT_PON == 0,
            REG_INT_STAT => self.regs[idx] &= !value,
            REG_INT_EN => self.regs[idx] = value & INT_MASK,
            // bootloader-side registers are only reachable through packets
            _ if !self.in_app0() => {}
            _ => self.regs[idx] = value,
        }
    }

    fn write_burst(&mut self, reg: u8, data: &[u8]) {
        for (i, v) in data.iter().enumerate() {
            self.write_reg(reg.wrapping_add(i as u8), *v);
        }

        if !self.in_app0() && reg == REG_BL_CMD_STAT {
            self.bootloader_packet(data);
        }

        if let Some(req) = self.pending_request.take() {
            self.handle_request(req);
        }

        let end = reg as usize + data.len();
        if self.in_app0() && (reg as usize..end).contains(&(REG_COMMAND as usize)) {
            self.run_command(self.regs[REG_COMMAND as usize]);
        }
    }

    fn handle_request(&mut self, req: u8) {
        match (self.app, req) {
            (current, req) if current == req => {}
            (APP_ID_APP0, APP_ID_BOOTLOADER) => self.enter_bootloader(),
            (APP_ID_BOOTLOADER, APP_ID_APP0) if self.config.rom_app0 => self.enter_app0(),
            _ => {}
        }
    }

    fn run_command(&mut self, command: u8) {
        self.commands.push(command);
        self.regs[REG_PREV_COMMAND as usize] = command;
        match command {
            CMD_STOP => self.measuring = false,
            CMD_FACTORY_CALIBRATION => {
                self.measuring = false;
                self.calibrating = true;
                self.calibration_remaining = self.config.calibration_reads;
            }
            _ => {
                self.measuring = true;
                if self.regs[REG_CMD_CAL_FLAGS as usize] & CAL_FLAG_FACTORY != 0 {
                    let start = REG_FACTORY_CALIB as usize;
                    self.applied_factory = Some(self.regs[start..start + FACTORY_CALIB_SIZE].to_vec());
                }
            }
        }
    }

    fn bootloader_packet(&mut self, bytes: &[u8]) {
        let (code, data) = match BlPacket::verify(bytes) {
            Ok(parsed) => parsed,
            Err(status) => {
                self.bl_status = status;
                return;
            }
        };
        let unlocked = self.salt.is_some();
        self.bl_status = match BlCommand::from_code(code) {
            Some(BlCommand::DownloadInit) => {
                self.salt = data.first().copied();
                BL_STAT_READY
            }
            Some(BlCommand::AddrRam) if unlocked && data.len() == 2 => {
                self.ram_addr = LittleEndian::read_u16(data);
                BL_STAT_READY
            }
            Some(BlCommand::WriteRam) if unlocked => {
                for b in data {
                    self.ram.insert(self.ram_addr, *b);
                    self.ram_addr = self.ram_addr.wrapping_add(1);
                }
                BL_STAT_READY
            }
            Some(BlCommand::RamRemapReset) if unlocked && !self.ram.is_empty() => {
                self.downloads += 1;
                self.enter_app0();
                return;
            }
            _ => BL_STAT_ERR_RANGE,
        };
    }
}

/// Shared handle to a simulated sensor.
#[derive(Clone)]
pub struct SimulatedSensor {
    inner: Arc<Mutex<SimState>>,
}

impl SimulatedSensor {
    /// Powered-on device sitting in the bootloader.
    pub fn new(config: SimConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimState::new(config))),
        }
    }

    /// Powered-on device already running App0.
    pub fn running_app0(config: SimConfig) -> Self {
        let sim = Self::new(config);
        sim.state().enter_app0();
        sim
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn app_id(&self) -> AppId {
        AppId::from(self.state().app)
    }

    /// Make every bus transfer fail until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.state().failing = failing;
    }

    /// Put the CPU into standby; it wakes on a STAT write.
    pub fn set_standby(&self) {
        self.state().standby = true;
    }

    pub fn set_calibration_reads(&self, reads: Option<u32>) {
        self.state().config.calibration_reads = reads;
    }

    pub fn set_calibration_blob(&self, blob: [u8; FACTORY_CALIB_SIZE]) {
        self.state().config.calibration_blob = blob;
    }

    pub fn set_rom_app0(&self, available: bool) {
        self.state().config.rom_app0 = available;
    }

    /// Latch a new result and raise the results interrupt. Returns `false`
    /// when App0 is not measuring.
    pub fn push_result(&self, distance_mm: u16, reliability: u8) -> bool {
        let mut st = self.state();
        if !st.in_app0() || !st.measuring {
            return false;
        }
        st.result_number = st.result_number.wrapping_add(1);
        let record = ResultRecord {
            result_number: st.result_number,
            reliability,
            distance_mm,
            sys_clock: u32::from(st.result_number) * 1000 + 1,
            temperature: 25,
            reference_hits: 10_000,
            object_hits: 5_000,
            ..Default::default()
        };
        let start = REG_RESULTS as usize;
        st.regs[start..start + RESULT_RECORD_SIZE].copy_from_slice(&record.to_bytes());
        st.regs[REG_REGISTER_CONTENTS as usize] = CONTENT_RESULTS;
        st.regs[REG_INT_STAT as usize] |= IRQ_RESULTS;
        true
    }

    /// Raise arbitrary interrupt status bits.
    pub fn raise_interrupt(&self, bits: u8) {
        self.state().regs[REG_INT_STAT as usize] |= bits;
    }

    pub fn set_diag_state(&self, mask: u8) {
        self.state().regs[REG_DIAG_STATE as usize] = mask;
    }

    pub fn set_device_error(&self, code: u8) {
        self.state().regs[REG_APP0_STATUS as usize] = code;
    }

    /// Register value without read side effects.
    pub fn peek(&self, reg: u8) -> u8 {
        self.state().regs[reg as usize]
    }

    pub fn writes(&self) -> Vec<(u8, Vec<u8>)> {
        self.state().writes.clone()
    }

    /// Values written to the command register, in order.
    pub fn commands(&self) -> Vec<u8> {
        self.state().commands.clone()
    }

    /// Transfers attempted, successful or not.
    pub fn bus_ops(&self) -> u64 {
        self.state().bus_ops
    }

    pub fn clear_log(&self) {
        let mut st = self.state();
        st.writes.clear();
        st.commands.clear();
        st.bus_ops = 0;
    }

    pub fn downloads(&self) -> u32 {
        self.state().downloads
    }

    pub fn salt(&self) -> Option<u8> {
        self.state().salt
    }

    pub fn measuring(&self) -> bool {
        self.state().measuring
    }

    /// Factory calibration blob latched by the last capture start.
    pub fn applied_factory_calibration(&self) -> Option<Vec<u8>> {
        self.state().applied_factory.clone()
    }
}

impl Default for SimulatedSensor {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

impl SensorTransport for SimulatedSensor {
    fn read(&mut self, reg: u8, buf: &mut [u8]) -> Result<(), BusError> {
        let mut st = self.state();
        st.check_bus(reg)?;
        for (i, b) in buf.iter_mut().enumerate() {
            *b = st.read_reg(reg.wrapping_add(i as u8));
        }
        Ok(())
    }

    fn write(&mut self, reg: u8, data: &[u8]) -> Result<(), BusError> {
        let mut st = self.state();
        st.check_bus(reg)?;
        st.writes.push((reg, data.to_vec()));
        st.write_burst(reg, data);
        Ok(())
    }

    fn has_chip_enable(&self) -> bool {
        self.state().config.has_chip_enable
    }

    fn set_chip_enable(&mut self, high: bool) -> Result<(), BusError> {
        let mut st = self.state();
        if !st.config.has_chip_enable {
            return Err(BusError::NoChipEnable);
        }
        match (st.enabled, high) {
            (false, true) => st.power_on(),
            (true, false) => st.power_off(),
            _ => {}
        }
        Ok(())
    }

    fn chip_enable(&self) -> Option<bool> {
        let st = self.state();
        st.config.has_chip_enable.then_some(st.enabled)
    }

    fn interrupt_asserted(&mut self) -> Option<bool> {
        let st = self.state();
        if !st.config.has_interrupt_line {
            return None;
        }
        let pending = st.regs[REG_INT_STAT as usize] & st.regs[REG_INT_EN as usize];
        Some(st.enabled && pending != 0)
    }
}
