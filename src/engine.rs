//! Operation state machine (component D) and execution driver (component E).
//!
//! This is the core described in spec.md §2 and §4.2–§4.3: one step function
//! per micro-state, shared unchanged between the blocking and non-blocking
//! execution shells. `Device::execute` is the mode-agnostic shell; every
//! other function here is the pure "given current state and the last HAL
//! result, emit the next HAL action" step spec.md §9 asks for.

use crate::addr;
use crate::busy::{self, BusyCheckState};
use crate::device::{Device, Mode};
use crate::error::Error;
use crate::hal::Hal;

/// Room for one opcode byte, a 4-byte address, and up to 2 dummy bytes
/// (1 configured + 1 implicit fast-read dummy), per spec.md §3.
const MAX_CMD_LEN: usize = 1 + 4 + 2;

/// Current micro-state of an in-flight operation. `Idle` iff no operation
/// is in flight (spec.md §3 invariant).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Op {
    Idle,
    WriteWren,
    WriteSadd,
    WriteSdata,
    EraseWren,
    EraseSeras,
    EraseChipWren,
    EraseChipSeras,
    WriteSrWren,
    WriteSrSdata,
    Read,
    FastRead,
    ReadSr,
    ReadSrBusy,
    ReadJedec,
    ReadProduct,
    ReadReg,
    WriteRegWren,
    WriteRegData,
    WriteRegSdatawait,
}

/// Does finishing this micro-state mean the chip may still be executing an
/// internal write/erase cycle when the *next* operation starts?
fn is_mutating(op: Op) -> bool {
    matches!(
        op,
        Op::WriteSdata
            | Op::EraseSeras
            | Op::EraseChipSeras
            | Op::WriteSrSdata
            | Op::WriteRegData
            | Op::WriteRegSdatawait
    )
}

impl<'a, H: Hal> Device<'a, H> {
    /// Issues the first HAL action of a newly staged request (component E,
    /// spec.md §4.2 step 2), honoring a pending busy pre-check.
    pub(crate) fn begin(&mut self) -> Result<(), Error<H::Error>> {
        if self.state.busy_pre_check {
            self.state.busy_check = BusyCheckState::PreCheck;
            return self.issue_busy_check_action();
        }
        self.issue_for_op()
    }

    /// Re-enters the machine with the outcome of the last HAL action. Used
    /// both by the blocking loop (synthesizing `Ok`) and by the public
    /// `async_trigger` entry point.
    pub(crate) fn continue_with(
        &mut self,
        last: Result<(), H::Error>,
    ) -> Result<(), Error<H::Error>> {
        if let Err(e) = last {
            let op = self.state.op;
            let result = Err(Error::Hal(e));
            self.finalize(op, &result);
            return result;
        }
        self.step()
    }

    fn step(&mut self) -> Result<(), Error<H::Error>> {
        match self.state.busy_check {
            BusyCheckState::PreCheck => self.handle_precheck_result(),
            BusyCheckState::Wait => self.handle_wait_complete(),
            BusyCheckState::ReadSr => self.handle_busy_readsr_complete(),
            BusyCheckState::Idle => self.on_transaction_done(),
        }
    }

    // -- busy pre-check --------------------------------------------------

    fn handle_precheck_result(&mut self) -> Result<(), Error<H::Error>> {
        self.hal.cs(false)?;
        self.state.busy_check = BusyCheckState::Idle;
        self.state.busy_pre_check = false;
        if self.state.sr_data & self.commands.sr_busy_mask != 0 {
            let op = self.state.op;
            return self.finish(op, Err(Error::HwBusy));
        }
        self.issue_for_op()
    }

    // -- busy-check subengine (component C) ------------------------------

    /// Starts (or restarts, at a halved period) the post-operation busy
    /// wait/poll loop. `op` stays unchanged while this runs.
    fn start_busy_check(&mut self, wait_ms: u32) -> Result<(), Error<H::Error>> {
        self.state.wait_period_ms = wait_ms;
        self.state.busy_check = BusyCheckState::Wait;
        self.issue_busy_check_action()
    }

    fn issue_busy_check_action(&mut self) -> Result<(), Error<H::Error>> {
        match self.state.busy_check {
            BusyCheckState::Wait => {
                self.hal.cs(false)?;
                self.hal.wait(self.state.wait_period_ms)?;
                Ok(())
            }
            BusyCheckState::ReadSr | BusyCheckState::PreCheck => {
                // State is already `ReadSr` or `PreCheck` as set by the
                // caller; only issue the read, so `step` can still tell
                // the two completions apart.
                self.hal.cs(true)?;
                let opcode = self.commands.read_sr;
                self.hal
                    .txrx(&[opcode], core::slice::from_mut(&mut self.state.sr_data))?;
                Ok(())
            }
            BusyCheckState::Idle => Err(Error::Internal),
        }
    }

    fn handle_wait_complete(&mut self) -> Result<(), Error<H::Error>> {
        if self.state.wait_period_ms == 0 {
            // BUSY-pin mode: HAL::wait already blocked until the pin released.
            self.state.busy_check = BusyCheckState::Idle;
            return self.on_busy_check_done();
        }
        self.state.busy_check = BusyCheckState::ReadSr;
        self.issue_busy_check_action()
    }

    fn handle_busy_readsr_complete(&mut self) -> Result<(), Error<H::Error>> {
        self.hal.cs(false)?;
        if self.state.sr_data & self.commands.sr_busy_mask != 0 {
            self.state.wait_period_ms = busy::halve(self.state.wait_period_ms);
            self.state.busy_check = BusyCheckState::Wait;
            self.issue_busy_check_action()
        } else {
            self.state.busy_check = BusyCheckState::Idle;
            self.on_busy_check_done()
        }
    }

    // -- per-op transitions -----------------------------------------------

    /// Builds `opcode + address + dummy` as an owned local buffer (kept off
    /// `self` so callers remain free to also borrow the payload).
    fn build_addressed(&self, opcode: u8, extra_dummy: u8) -> ([u8; MAX_CMD_LEN], usize) {
        let mut buf = [0u8; MAX_CMD_LEN];
        let addr_width = self.config.addr_width as usize;
        let dummy = self.config.addr_dummy_bytes as usize + extra_dummy as usize;
        buf[0] = opcode;
        addr::encode(
            self.state.addr,
            self.config.addr_width,
            self.config.addr_endianness,
            &mut buf[1..1 + addr_width],
        );
        (buf, 1 + addr_width + dummy)
    }

    fn issue_for_op(&mut self) -> Result<(), Error<H::Error>> {
        self.hal.cs(true)?;
        match self.state.op {
            Op::WriteWren | Op::EraseWren | Op::EraseChipWren | Op::WriteSrWren | Op::WriteRegWren => {
                let opcode = self.commands.write_enable;
                self.hal.txrx(&[opcode], &mut [])?;
            }
            Op::WriteSadd => {
                let opcode = self.commands.page_program;
                let (buf, len) = self.build_addressed(opcode, 0);
                self.hal.txrx(&buf[..len], &mut [])?;
            }
            Op::WriteSdata => {
                let (ptr, len) = self.state.payload.write_ptr_len();
                // SAFETY: `ptr`/`len` describe the buffer passed to
                // `Device::write`, which the caller must keep valid until
                // the operation finalizes (documented there).
                let src = unsafe { core::slice::from_raw_parts(ptr, len) };
                let offset = len - self.state.remaining as usize;
                let chunk = self
                    .config
                    .page_remainder(self.state.addr)
                    .min(self.state.remaining) as usize;
                self.hal.txrx(&src[offset..offset + chunk], &mut [])?;
            }
            Op::EraseSeras => {
                let mask = self.commands.supported_erase_mask();
                let size =
                    crate::erase::largest_erase_area(self.state.addr, self.state.remaining, mask);
                if size == 0 {
                    return self.finish(Op::EraseSeras, Err(Error::BadConfig));
                }
                let opcode = match self.commands.erase_opcode(size) {
                    Some(op) => op,
                    None => return self.finish(Op::EraseSeras, Err(Error::BadConfig)),
                };
                self.state.current_erase_size = size;
                let (buf, len) = self.build_addressed(opcode, 0);
                self.hal.txrx(&buf[..len], &mut [])?;
            }
            Op::EraseChipSeras => {
                let opcode = self.commands.chip_erase;
                self.hal.txrx(&[opcode], &mut [])?;
            }
            Op::WriteSrSdata => {
                let opcode = self.commands.write_sr;
                self.hal.txrx(&[opcode, self.state.sr_write_byte], &mut [])?;
            }
            Op::Read => {
                let opcode = self.commands.read_data;
                let (buf, len) = self.build_addressed(opcode, 0);
                let (ptr, dlen) = self.state.payload.read_ptr_len();
                // SAFETY: see `Device::read`.
                let dst = unsafe { core::slice::from_raw_parts_mut(ptr, dlen) };
                self.hal.txrx(&buf[..len], dst)?;
            }
            Op::FastRead => {
                let opcode = self.commands.read_data_fast;
                let (buf, len) = self.build_addressed(opcode, 1);
                let (ptr, dlen) = self.state.payload.read_ptr_len();
                // SAFETY: see `Device::fast_read`.
                let dst = unsafe { core::slice::from_raw_parts_mut(ptr, dlen) };
                self.hal.txrx(&buf[..len], dst)?;
            }
            Op::ReadSr => {
                let opcode = self.commands.read_sr;
                let (ptr, dlen) = self.state.payload.read_ptr_len();
                // SAFETY: see `Device::read_sr`.
                let dst = unsafe { core::slice::from_raw_parts_mut(ptr, dlen) };
                self.hal.txrx(&[opcode], dst)?;
            }
            Op::ReadSrBusy => {
                let opcode = self.commands.read_sr;
                self.hal
                    .txrx(&[opcode], core::slice::from_mut(&mut self.state.sr_data))?;
            }
            Op::ReadJedec => {
                let opcode = self.commands.jedec_id;
                let (ptr, dlen) = self.state.payload.read_ptr_len();
                // SAFETY: see `Device::read_jedec_id`.
                let dst = unsafe { core::slice::from_raw_parts_mut(ptr, dlen) };
                self.hal.txrx(&[opcode], dst)?;
            }
            Op::ReadProduct => {
                let opcode = self.commands.device_id;
                let (ptr, dlen) = self.state.payload.read_ptr_len();
                // SAFETY: see `Device::read_product_id`.
                let dst = unsafe { core::slice::from_raw_parts_mut(ptr, dlen) };
                self.hal.txrx(&[opcode], dst)?;
            }
            Op::ReadReg => {
                // No dedicated opcode exists in the command table for
                // vendor-register access (spec.md §3 lists none); this
                // reuses `read_sr`'s opcode with the register index as a
                // second byte (see DESIGN.md).
                let opcode = self.commands.read_sr;
                let reg = self.state.reg_nbr;
                let (ptr, dlen) = self.state.payload.read_ptr_len();
                // SAFETY: see `Device::read_reg`.
                let dst = unsafe { core::slice::from_raw_parts_mut(ptr, dlen) };
                self.hal.txrx(&[opcode, reg], dst)?;
            }
            Op::WriteRegData | Op::WriteRegSdatawait => {
                let opcode = self.commands.write_sr;
                self.hal
                    .txrx(&[opcode, self.state.reg_nbr, self.state.reg_data], &mut [])?;
            }
            Op::Idle => return Err(Error::Internal),
        }
        Ok(())
    }

    fn on_transaction_done(&mut self) -> Result<(), Error<H::Error>> {
        self.hal.cs(false)?;
        match self.state.op {
            Op::WriteWren => {
                self.state.op = Op::WriteSadd;
                self.issue_for_op()
            }
            Op::WriteSadd => {
                self.state.op = Op::WriteSdata;
                self.issue_for_op()
            }
            Op::WriteSdata => {
                let chunk = self
                    .config
                    .page_remainder(self.state.addr)
                    .min(self.state.remaining);
                self.state.addr += chunk;
                self.state.remaining -= chunk;
                let ms = self.config.page_program_ms;
                self.start_busy_check(ms)
            }
            Op::EraseWren => {
                self.state.op = Op::EraseSeras;
                self.issue_for_op()
            }
            Op::EraseSeras => {
                let size = self.state.current_erase_size;
                self.state.addr += size;
                self.state.remaining -= size;
                let idx = (size.trailing_zeros() - 12) as usize;
                let ms = self.config.erase_ms[idx];
                self.start_busy_check(ms)
            }
            Op::EraseChipWren => {
                self.state.op = Op::EraseChipSeras;
                self.issue_for_op()
            }
            Op::EraseChipSeras => {
                let ms = self.config.chip_erase_ms;
                self.start_busy_check(ms)
            }
            Op::WriteSrWren => {
                self.state.op = Op::WriteSrSdata;
                self.issue_for_op()
            }
            Op::WriteSrSdata => {
                let ms = self.config.sr_write_ms;
                self.start_busy_check(ms)
            }
            Op::Read | Op::FastRead | Op::ReadSr | Op::ReadJedec | Op::ReadProduct | Op::ReadReg => {
                self.finish(self.state.op, Ok(()))
            }
            Op::ReadSrBusy => {
                let busy = self.state.sr_data & self.commands.sr_busy_mask != 0;
                let ptr = self.state.payload.bool_ptr();
                // SAFETY: staged by `Device::read_sr_busy`, valid for the
                // lifetime of the request.
                unsafe { *ptr = busy };
                self.finish(Op::ReadSrBusy, Ok(()))
            }
            Op::WriteRegWren => {
                self.state.op = if self.state.reg_wait_ms > 0 {
                    Op::WriteRegSdatawait
                } else {
                    Op::WriteRegData
                };
                self.issue_for_op()
            }
            Op::WriteRegData => self.finish(Op::WriteRegData, Ok(())),
            Op::WriteRegSdatawait => {
                let ms = self.state.reg_wait_ms;
                self.start_busy_check(ms)
            }
            Op::Idle => Err(Error::Internal),
        }
    }

    fn on_busy_check_done(&mut self) -> Result<(), Error<H::Error>> {
        match self.state.op {
            Op::WriteSdata => {
                if self.state.remaining == 0 {
                    self.finish(Op::WriteSdata, Ok(()))
                } else {
                    self.state.op = Op::WriteWren;
                    self.issue_for_op()
                }
            }
            Op::EraseSeras => {
                if self.state.remaining == 0 {
                    self.finish(Op::EraseSeras, Ok(()))
                } else {
                    self.state.op = Op::EraseWren;
                    self.issue_for_op()
                }
            }
            Op::EraseChipSeras => self.finish(Op::EraseChipSeras, Ok(())),
            Op::WriteSrSdata => self.finish(Op::WriteSrSdata, Ok(())),
            Op::WriteRegSdatawait => self.finish(Op::WriteRegSdatawait, Ok(())),
            _ => Err(Error::Internal),
        }
    }

    fn finish(
        &mut self,
        op: Op,
        result: Result<(), Error<H::Error>>,
    ) -> Result<(), Error<H::Error>> {
        self.finalize(op, &result);
        result
    }

    /// Common teardown for every terminating path: error or natural arrival
    /// at `Idle` (spec.md §4.4). `could_be_busy` is the persistent hint
    /// carried into the *next* request; it is promoted to an actual
    /// pre-check in [`Device::execute`], not here (spec.md §9).
    pub(crate) fn finalize(&mut self, op: Op, result: &Result<(), Error<H::Error>>) {
        let _ = self.hal.cs(false);
        self.state.op = Op::Idle;
        self.state.wait_period_ms = 0;
        if is_mutating(op) {
            self.state.could_be_busy = result.is_ok();
        }
        self.state.busy_check = BusyCheckState::Idle;
        self.state.payload = crate::device::Payload::None;
        if self.mode == Mode::NonBlocking {
            if let Some(cb) = self.callback.as_deref_mut() {
                cb(op, result);
            }
        }
    }
}
