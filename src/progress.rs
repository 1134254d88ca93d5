//! Progress reporting for a request.
//!
//! The orchestrator reports a single overall fraction. Displays split it into
//! three phases: model loading, generation and upscaling.

/// Receives progress updates. `fraction` grows from 0 to 1 over a request.
pub trait Progress {
    fn report(&mut self, fraction: f64, message: Option<&str>);
}

const LOAD_END: f64 = 0.2;
const GENERATE_END: f64 = 0.85;

/// Completion of each phase, each in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseProgress {
    pub load: f64,
    pub generate: f64,
    pub upscale: f64,
}

impl PhaseProgress {
    pub fn from_fraction(fraction: f64) -> Self {
        let phase = |start: f64, end: f64| ((fraction - start) / (end - start)).clamp(0., 1.);
        Self {
            load: phase(0., LOAD_END),
            generate: phase(LOAD_END, GENERATE_END),
            upscale: phase(GENERATE_END, 1.),
        }
    }

    fn percents(&self) -> [u32; 3] {
        [self.load, self.generate, self.upscale].map(|p| (p * 100.).round() as u32)
    }
}

/// Prints the three phase bars on stdout whenever one of them moves.
#[derive(Debug, Default)]
pub struct ConsoleProgress {
    last: Option<[u32; 3]>,
}

impl ConsoleProgress {
    pub fn new() -> Self {
        Self::default()
    }
}

fn bar(percent: u32) -> String {
    let filled = (percent / 5) as usize;
    format!("{}{}", "#".repeat(filled), "-".repeat(20 - filled))
}

impl Progress for ConsoleProgress {
    fn report(&mut self, fraction: f64, message: Option<&str>) {
        let percents = PhaseProgress::from_fraction(fraction).percents();
        if self.last != Some(percents) {
            let [load, generate, upscale] = percents;
            println!(
                "load [{}] {load:>3}%  generate [{}] {generate:>3}%  upscale [{}] {upscale:>3}%",
                bar(load),
                bar(generate),
                bar(upscale)
            );
            self.last = Some(percents);
        }
        if let Some(message) = message {
            println!("{message}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases() {
        let p = PhaseProgress::from_fraction(0.1);
        assert!((p.load - 0.5).abs() < 1e-9);
        assert_eq!((p.generate, p.upscale), (0., 0.));

        let p = PhaseProgress::from_fraction(0.6);
        assert_eq!(p.load, 1.);
        assert!((p.generate - 0.4 / 0.65).abs() < 1e-9);

        let p = PhaseProgress::from_fraction(1.0);
        assert_eq!(p.percents(), [100, 100, 100]);

        let p = PhaseProgress::from_fraction(1.5);
        assert_eq!(p.upscale, 1.);
    }

    #[test]
    fn bars_have_fixed_width() {
        assert_eq!(bar(0).len(), 20);
        assert_eq!(bar(100), "#".repeat(20));
        assert_eq!(bar(52), format!("{}{}", "#".repeat(10), "-".repeat(10)));
    }
}
