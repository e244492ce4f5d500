// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Demo image for the STM32F407 Discovery board.
//!
//! Boot order mirrors the kernel's expectations: bring up the console
//! USART (buffered, interrupt-driven), hand the kernel its heap pool,
//! create the application tasks, and start the scheduler. The shell runs
//! on USART2 (PA2/PA3, the usual serial header pins) at 115200-8-N-1.
//!
//! The whole image is gated on `target_os = "none"` so `cargo
//! build`/`cargo test` on a development host sees only an empty stub.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod image {
    use core::ptr::{addr_of, addr_of_mut};
    use core::sync::atomic::{AtomicU32, Ordering};
    use cortex_m_rt::entry;
    use drv_stm32f4_usart::{device, UartBuffers, Usart};
    use panic_halt as _;
    use shell::{sh_print, Shell};

    /// Default boot speed, until we bother raising it: the F407 comes
    /// out of reset on the 16 MHz internal oscillator.
    const CPU_HZ: u32 = 16_000_000;
    const BAUD_RATE: u32 = 115_200;

    /// NVIC priority for the console USART: above the tick, below the
    /// kernel's syscall ceiling, so the ISR preempts everything except
    /// kernel critical sections.
    const USART2_PRIORITY: u8 = 10;

    /// Pool backing the kernel heap (and thereby all task stacks).
    #[repr(C, align(8))]
    struct HeapPool([u8; 64 * 1024]);
    static mut HEAP_POOL: HeapPool = HeapPool([0; 64 * 1024]);

    static CONSOLE_BUFFERS: UartBuffers = UartBuffers::new();

    /// Console handle, written once during init, read by the ISR and the
    /// shell's I/O shims.
    static mut CONSOLE: Option<Usart> = None;

    static mut SHELL: Shell = Shell::new("OS> ", console_getc, console_puts);

    fn console() -> Option<Usart> {
        // Safety: written exactly once in `main` before interrupts and
        // tasks exist; all later access is read-only of a Copy value.
        unsafe { *addr_of!(CONSOLE) }
    }

    fn console_getc() -> Option<u8> {
        console().and_then(|c| c.read_byte())
    }

    fn console_puts(bytes: &[u8]) -> usize {
        console().map_or(0, |c| c.write(bytes))
    }

    /// Console interrupt. (Name is dictated by the vector table the PAC
    /// provides; a strong definition overrides its weak default.)
    #[allow(non_snake_case)]
    #[no_mangle]
    unsafe extern "C" fn USART2() {
        if let Some(c) = console() {
            c.irq_handler();
        }
    }

    // --- application tasks ---

    static HEARTBEATS: AtomicU32 = AtomicU32::new(0);

    /// Stand-in for real periodic work: wakes twice a second and counts.
    extern "C" fn heartbeat_main(_arg: usize) {
        loop {
            let _ = kern::syscalls::sleep_ticks(500);
            HEARTBEATS.fetch_add(1, Ordering::Relaxed);
        }
    }

    extern "C" fn shell_main(_arg: usize) {
        // Safety: the shell static is only ever touched by this task
        // once the scheduler is running (registration happened before).
        unsafe { (*addr_of_mut!(SHELL)).run() }
    }

    fn cmd_beats(sh: &mut Shell, _argv: &[&str]) -> i32 {
        sh_print!(sh, "Heartbeats: {}\r\n", HEARTBEATS.load(Ordering::Relaxed));
        0
    }

    static BEATS: shell::Command = shell::Command {
        name: "beats",
        help: "Show heartbeat count",
        handler: cmd_beats,
    };

    #[entry]
    fn main() -> ! {
        let p = unsafe { device::Peripherals::steal() };

        // Clock the console's port and peripheral.
        p.RCC.ahb1enr.modify(|_, w| w.gpioaen().set_bit());
        p.RCC.apb1enr.modify(|_, w| w.usart2en().set_bit());

        // Mux the USART onto the output pins. We're using PA2/3, where
        // USART2 is selected by Alternate Function 7.
        p.GPIOA
            .moder
            .modify(|_, w| w.moder2().alternate().moder3().alternate());
        p.GPIOA.afrl.modify(|_, w| w.afrl2().af7().afrl3().af7());

        // From thin air, pluck a pointer to the USART register block.
        //
        // Safety: the USART is essentially a static, and we access it
        // through a & reference so aliasing is not a concern.
        let regs = unsafe { &*device::USART2::ptr() };
        let uart = Usart::turn_on(regs, &CONSOLE_BUFFERS, CPU_HZ, BAUD_RATE);
        // Safety: interrupts are still masked at the NVIC and no task
        // exists yet; nothing else can observe the write.
        unsafe { *addr_of_mut!(CONSOLE) = Some(uart) };

        let _ = uart.send_str_blocking("\r\nbooting\r\n");

        // Kernel heap over the static pool; stacks come from here.
        // Safety: the pool is dedicated to the heap and lives forever.
        let heap_ok = unsafe {
            let pool = addr_of_mut!(HEAP_POOL);
            kern::heap::init((*pool).0.as_mut_ptr(), (*pool).0.len())
        };
        if heap_ok.is_err() {
            panic!("heap init");
        }

        kern::startup::init();

        // Safety: pre-scheduler, single-threaded; the shell static has
        // no other observers yet.
        let sh = unsafe { &mut *addr_of_mut!(SHELL) };
        if shell::commands::register_all(sh).is_err() || sh.register(&BEATS).is_err() {
            panic!("command registry full");
        }

        if kern::startup::create(heartbeat_main, 0, 1024).is_err()
            || kern::startup::create(shell_main, 0, 2048).is_err()
        {
            panic!("task create");
        }

        // Console interrupt: sits above SysTick, below the syscall
        // ceiling, and is unmasked only now that its handler's data
        // exists.
        unsafe {
            let nvic = &*cortex_m::peripheral::NVIC::PTR;
            nvic.ipr[device::Interrupt::USART2 as usize].write(USART2_PRIORITY << 4);
            cortex_m::peripheral::NVIC::unmask(device::Interrupt::USART2);
        }

        kern::startup::start(CPU_HZ)
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    // Nothing to do on the host; the image only makes sense on the
    // board. See `package.metadata.build` for the target.
}
