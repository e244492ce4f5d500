// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Buffered driver for the STM32F4 U(S)ART.
//!
//! USARTs are inherently single-owner, so this is structured as a lib
//! rather than a task of its own: the board code turns a port on, parks
//! the ring buffers in a `static`, and forwards the port's interrupt to
//! [`Usart::irq_handler`].
//!
//! Two I/O styles coexist:
//!
//! - blocking byte/string sends with a bounded flag wait, for before the
//!   scheduler runs;
//! - interrupt-driven rings for normal operation: the receive interrupt
//!   fills the RX ring (counting overflow and line errors), and the
//!   transmit-empty interrupt drains the TX ring, disabling itself when
//!   the ring runs dry. Task-side accessors wrap ring operations in the
//!   kernel's priority ceiling, keeping the single-producer/
//!   single-consumer discipline intact.
//!
//! Clock enable and pin mux are the board's problem; see the demo app.

#![no_std]

pub use stm32f4::stm32f407 as device;

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use kern::arch::with_priority_ceiling;
use spsc_ring::Ring;

/// RX software buffer size. One slot is reserved, so 255 bytes are
/// storable.
pub const RX_BUFFER_SIZE: usize = 256;
/// TX software buffer size.
pub const TX_BUFFER_SIZE: usize = 512;

/// Iteration bound for hardware flag waits. A loop count, not a time
/// unit; generous enough for one character time at any sane baud rate.
pub const UART_MAX_ITERATIONS: u32 = 100_000;

/// Driver errors. Discriminants are the stable negative status codes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum UartError {
    /// A hardware flag did not show up within the iteration bound.
    Timeout = -1,
    /// Receiver overrun: the peripheral dropped data before we read it.
    Overrun = -2,
    /// Stop bit not where it should be.
    Framing = -3,
    /// Noise detected on the line during reception.
    Noise = -4,
    /// Parity check failed.
    Parity = -5,
}

/// Per-byte receive hook, invoked from interrupt context. Keep it short.
pub type RxCallback = fn(u8);

// SR error flags, named as in the reference manual. Classified from the
// raw register value because that is how the error path treats them: as
// a group, cleared together by the SR-then-DR read sequence.
const SR_PE: u32 = 1 << 0;
const SR_FE: u32 = 1 << 1;
const SR_NF: u32 = 1 << 2;
const SR_ORE: u32 = 1 << 3;
const SR_ERR_MASK: u32 = SR_PE | SR_FE | SR_NF | SR_ORE;

/// Ring buffers and counters for one USART. Lives in a `static` next to
/// the interrupt handler that feeds it.
pub struct UartBuffers {
    rx: Ring<RX_BUFFER_SIZE>,
    tx: Ring<TX_BUFFER_SIZE>,
    /// Bytes dropped because the RX ring was full. Written only by the
    /// ISR; monotonic, never reset.
    rx_overflow: AtomicU32,
    /// Parity/framing/noise/overrun events seen by the ISR. The byte is
    /// still delivered when the hardware hands us one.
    rx_errors: AtomicU32,
    /// Bytes dropped because the TX ring was full at `write` time.
    tx_overflow: AtomicU32,
    /// Registered RX callback as a raw fn address; 0 means none.
    rx_callback: AtomicUsize,
}

impl UartBuffers {
    pub const fn new() -> Self {
        UartBuffers {
            rx: Ring::new(),
            tx: Ring::new(),
            rx_overflow: AtomicU32::new(0),
            rx_errors: AtomicU32::new(0),
            tx_overflow: AtomicU32::new(0),
            rx_callback: AtomicUsize::new(0),
        }
    }
}

impl Default for UartBuffers {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to an enabled USART plus its buffers. Cheap to copy; the board
/// keeps one for its tasks and one reachable from the ISR.
#[derive(Copy, Clone)]
pub struct Usart {
    usart: &'static device::usart1::RegisterBlock,
    bufs: &'static UartBuffers,
}

impl Usart {
    /// Turns on the USART described by `usart` at `baud_rate`, given the
    /// peripheral clock. The caller has already enabled the peripheral
    /// clock and muxed the pins.
    ///
    /// Receive interrupts are enabled at the peripheral from the start;
    /// the corresponding NVIC line is the caller's to unmask once its
    /// handler is wired to [`Usart::irq_handler`].
    pub fn turn_on(
        usart: &'static device::usart1::RegisterBlock,
        bufs: &'static UartBuffers,
        clock_hz: u32,
        baud_rate: u32,
    ) -> Self {
        // The UART has clock and is out of reset, but isn't actually on
        // until we:
        usart.cr1.modify(|_, w| w.ue().set_bit());

        // Work out our baud rate divisor. BRR is mantissa[15:4] /
        // fraction[3:0] with 16x oversampling, which is exactly the
        // cycles-per-bit count.
        let cycles_per_bit = (clock_hz + (baud_rate / 2)) / baud_rate;
        // Safety: any 16-bit divisor is a legal BRR value.
        usart.brr.write(|w| unsafe { w.bits(cycles_per_bit) });

        // Enable the transmitter and receiver, and receive interrupts.
        usart
            .cr1
            .modify(|_, w| w.te().set_bit().re().set_bit().rxneie().set_bit());

        Usart { usart, bufs }
    }

    // --- blocking path (pre-scheduler console, panics, banners) ---

    /// Sends one byte, spinning (bounded) for the transmit register.
    pub fn send_byte_blocking(&self, byte: u8) -> Result<(), UartError> {
        wait_for(|| self.usart.sr.read().txe().bit(), UART_MAX_ITERATIONS)?;
        // Safety: DR takes any byte value.
        self.usart.dr.write(|w| unsafe { w.bits(u32::from(byte)) });
        Ok(())
    }

    /// Sends a string through the blocking path.
    pub fn send_str_blocking(&self, s: &str) -> Result<(), UartError> {
        for &b in s.as_bytes() {
            self.send_byte_blocking(b)?;
        }
        Ok(())
    }

    /// Receives one byte, spinning (bounded) for data. Reports line
    /// errors seen with the byte.
    pub fn recv_byte_blocking(&self) -> Result<u8, UartError> {
        wait_for(|| self.usart.sr.read().rxne().bit(), UART_MAX_ITERATIONS)?;
        let sr = self.usart.sr.read().bits();
        // Reading DR after SR clears RXNE and any latched error flags.
        let byte = self.usart.dr.read().dr().bits() as u8;
        if sr & SR_ORE != 0 {
            Err(UartError::Overrun)
        } else if sr & SR_FE != 0 {
            Err(UartError::Framing)
        } else if sr & SR_NF != 0 {
            Err(UartError::Noise)
        } else if sr & SR_PE != 0 {
            Err(UartError::Parity)
        } else {
            Ok(byte)
        }
    }

    // --- interrupt-driven path ---

    /// Enqueues as much of `src` as fits in the TX ring and arms the
    /// transmit-empty interrupt if anything was queued. Returns the
    /// number of bytes accepted; the rest are dropped and counted, never
    /// blocked on.
    pub fn write(&self, src: &[u8]) -> usize {
        with_priority_ceiling(|| {
            let mut sent = 0;
            for &b in src {
                if self.bufs.tx.try_push(b).is_err() {
                    self.bufs
                        .tx_overflow
                        .fetch_add((src.len() - sent) as u32, Ordering::Relaxed);
                    break;
                }
                sent += 1;
            }
            if sent > 0 {
                self.usart.cr1.modify(|_, w| w.txeie().set_bit());
            }
            sent
        })
    }

    /// Bytes waiting in the RX ring.
    pub fn available(&self) -> usize {
        with_priority_ceiling(|| self.bufs.rx.len())
    }

    /// Drains up to `dst.len()` bytes from the RX ring; returns the
    /// count copied. Never blocks.
    pub fn read(&self, dst: &mut [u8]) -> usize {
        with_priority_ceiling(|| {
            let mut n = 0;
            while n < dst.len() {
                match self.bufs.rx.try_pop() {
                    Some(b) => {
                        dst[n] = b;
                        n += 1;
                    }
                    None => break,
                }
            }
            n
        })
    }

    /// Pops a single byte from the RX ring.
    pub fn read_byte(&self) -> Option<u8> {
        with_priority_ceiling(|| self.bufs.rx.try_pop())
    }

    /// Bytes still queued in the TX ring.
    pub fn tx_pending(&self) -> usize {
        with_priority_ceiling(|| self.bufs.tx.len())
    }

    /// Waits for everything queued to really leave the wire: yields
    /// while the ISR drains the software ring, then spins (bounded) on
    /// the hardware transmission-complete flag and clears it.
    pub fn flush(&self) -> Result<(), UartError> {
        while self.tx_pending() > 0 {
            kern::syscalls::yield_cpu();
        }
        wait_for(|| self.usart.sr.read().tc().bit(), UART_MAX_ITERATIONS)?;
        // SR flags here are rc_w0: writing 0 clears, writing 1 leaves
        // alone. Drop only TC, giving the next flush an edge to wait on.
        // Safety: clearing status flags has no other effect.
        self.usart.sr.write(|w| unsafe { w.bits(!(1 << 6)) });
        Ok(())
    }

    /// Enables or disables the receive interrupt at the peripheral.
    pub fn enable_rx_interrupt(&self, enable: bool) {
        self.usart.cr1.modify(|_, w| {
            if enable {
                w.rxneie().set_bit()
            } else {
                w.rxneie().clear_bit()
            }
        });
    }

    /// Registers a per-byte RX hook, called from the ISR after the byte
    /// is buffered. Register before unmasking the interrupt.
    pub fn set_rx_callback(&self, cb: RxCallback) {
        self.bufs.rx_callback.store(cb as usize, Ordering::Relaxed);
    }

    /// Bytes dropped on RX-ring overflow so far.
    pub fn overflow_count(&self) -> u32 {
        self.bufs.rx_overflow.load(Ordering::Relaxed)
    }

    /// Line errors (parity/framing/noise/overrun) counted so far.
    pub fn error_count(&self) -> u32 {
        self.bufs.rx_errors.load(Ordering::Relaxed)
    }

    /// The interrupt handler body. The board's interrupt handler for
    /// this USART calls here and nothing else.
    ///
    /// RX side: consume the data register (which also clears the error
    /// flags read alongside it), count errors, and publish the byte into
    /// the ring or count the overflow. TX side: feed the data register
    /// from the ring, or disable the transmit-empty source once empty --
    /// that is the only way this interrupt quiesces.
    pub fn irq_handler(&self) {
        let sr = self.usart.sr.read();

        if sr.rxne().bit() {
            let byte = self.usart.dr.read().dr().bits() as u8;

            if sr.bits() & SR_ERR_MASK != 0 {
                self.bufs.rx_errors.fetch_add(1, Ordering::Relaxed);
            }

            if self.bufs.rx.try_push(byte).is_err() {
                self.bufs.rx_overflow.fetch_add(1, Ordering::Relaxed);
            }

            let raw = self.bufs.rx_callback.load(Ordering::Relaxed);
            if raw != 0 {
                // Safety: the only value ever stored is a fn(u8) in
                // set_rx_callback.
                let cb: RxCallback = unsafe { core::mem::transmute::<usize, RxCallback>(raw) };
                cb(byte);
            }
        }

        if self.usart.cr1.read().txeie().bit() && self.usart.sr.read().txe().bit() {
            match self.bufs.tx.try_pop() {
                Some(byte) => {
                    // Safety: DR takes any byte value.
                    self.usart.dr.write(|w| unsafe { w.bits(u32::from(byte)) });
                }
                None => {
                    // Ring is empty; stop the interrupt source.
                    self.usart.cr1.modify(|_, w| w.txeie().clear_bit());
                }
            }
        }
    }
}

/// Spins until `cond` holds, up to `max_iter` polls.
fn wait_for(mut cond: impl FnMut() -> bool, max_iter: u32) -> Result<(), UartError> {
    for _ in 0..max_iter {
        if cond() {
            return Ok(());
        }
    }
    Err(UartError::Timeout)
}
