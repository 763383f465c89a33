// Serial logging over the first UART
#[cfg(not(test))]
use lazy_static::lazy_static;
#[cfg(not(test))]
use spin::Mutex;
#[cfg(not(test))]
use uart_16550::SerialPort;

#[cfg(not(test))]
lazy_static! {
    pub static ref SERIAL1: Mutex<SerialPort> = {
        let mut serial_port = unsafe { SerialPort::new(0x3F8) };
        serial_port.init();
        Mutex::new(serial_port)
    };
}

#[cfg(not(test))]
#[doc(hidden)]
pub fn _print(args: ::core::fmt::Arguments) {
    use core::fmt::Write;
    use x86_64::instructions::interrupts;

    interrupts::without_interrupts(|| {
        SERIAL1
            .lock()
            .write_fmt(args)
            .expect("Printing to serial failed");
    });
}

// The host test harness has no UART; route to stdout instead.
#[cfg(test)]
#[doc(hidden)]
pub fn _print(args: ::core::fmt::Arguments) {
    use std::io::Write;
    std::io::stdout().write_fmt(args).expect("Printing failed");
}

#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($fmt:expr) => ($crate::serial_print!(concat!($fmt, "\n")));
    ($fmt:expr, $($arg:tt)*) => ($crate::serial_print!(concat!($fmt, "\n"), $($arg)*));
}
