// edge_counter.rs - Counts debounced button presses on a pin using edge detection.
//
// Connect a push button between BCM GPIO 17 and GND. The pin's built-in pull-up
// resistor keeps it high until the button is pressed.

use std::error::Error;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

// The simple-signal crate is used to handle incoming signals.
use simple_signal::{self, Signal};

use gpioport::gpio::{Edge, Gpio, Level, Mode, PullUpDown};

// Gpio uses BCM pin numbering. BCM GPIO 17 is tied to physical pin 11.
const GPIO_BUTTON: u8 = 17;
const BOUNCE_TIME: Duration = Duration::from_millis(50);

fn main() -> Result<(), Box<dyn Error>> {
    let presses = Arc::new(AtomicUsize::new(0));

    // The callback runs on the event poller thread for every accepted edge.
    let gpio = Gpio::with_events({
        let presses = presses.clone();
        move |pin, level| {
            if level == Level::Low {
                let count = presses.fetch_add(1, Ordering::SeqCst) + 1;
                println!("Pin {} pressed ({} total)", pin, count);
            }
        }
    })?;

    let mut button = gpio.get(GPIO_BUTTON, Mode::Input, PullUpDown::PullUp)?;
    button.add_edge_detect(Edge::Falling, BOUNCE_TIME)?;

    let running = Arc::new(AtomicBool::new(true));

    // When a SIGINT (Ctrl-C) or SIGTERM signal is caught, atomically set running to false.
    simple_signal::set_handler(&[Signal::Int, Signal::Term], {
        let running = running.clone();
        move |_| {
            running.store(false, Ordering::SeqCst);
        }
    });

    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(100));
    }

    button.remove_edge_detect();
    println!("Counted {} presses", presses.load(Ordering::SeqCst));

    Ok(())

    // When button goes out of scope, the pin is reset to an input without
    // pull-up/pull-down, provided reset_on_drop is set to true (default).
}
