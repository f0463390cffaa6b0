/// Finds the shared SPI completion interrupt in /proc/interrupts.

use std::fs;
use std::io;

use log::{info, warn};
use regex::Regex;
use thiserror::Error;

use crate::config::DiscoveryConfig;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("{controller} is claimed by a kernel SPI driver (IRQ {irq}); disable it in /boot/config.txt")]
    Conflict { controller: String, irq: u32 },

    #[error("no interrupt line found for {0}")]
    NotFound(String),
}

/// Interrupt number of the line whose action list names `controller`.
fn find_line(text: &str, controller: &str) -> Option<u32> {
    let pattern = format!(r"(?m)^\s*(\d+):.*{}", regex::escape(controller));
    // escaped input always forms a valid pattern
    let re = Regex::new(&pattern).ok()?;
    re.captures(text)?.get(1)?.as_str().parse().ok()
}

pub fn parse_interrupts(text: &str, config: &DiscoveryConfig) -> Result<u32, DiscoveryError> {
    let mut conflict = None;
    for controller in &config.conflicting_controllers {
        if let Some(irq) = find_line(text, controller) {
            warn!("The {} device is enabled - this will interfere with the driver", controller);
            conflict.get_or_insert(DiscoveryError::Conflict {
                controller: controller.clone(),
                irq,
            });
        }
    }
    if let Some(e) = conflict {
        return Err(e);
    }

    find_line(text, &config.completion_controller)
        .ok_or_else(|| DiscoveryError::NotFound(config.completion_controller.clone()))
}

/// Configured interrupt number, or the one read from /proc/interrupts.
pub fn discover(config: &DiscoveryConfig) -> Result<u32, DiscoveryError> {
    if let Some(irq) = config.irq {
        info!("Using configured completion IRQ {}", irq);
        return Ok(irq);
    }

    let text = fs::read_to_string(&config.proc_interrupts).map_err(|source| DiscoveryError::Read {
        path: config.proc_interrupts.clone(),
        source,
    })?;
    let irq = parse_interrupts(&text, config)?;
    info!(
        "{} interrupt number is {} - the driver will attach SPI0 / SPI6 handlers to it",
        config.completion_controller, irq
    );
    Ok(irq)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLEAN: &str = "           CPU0       CPU1       CPU2       CPU3
 11:      45678      12345       6789       1011     GICv2  30 Level     arch_timer
 35:          0          0          0          0     GICv2 114 Level     DMA IRQ
 57:        120          0          0          0     GICv2 150 Level     fe204a00.spi
 61:          3          0          0          0     GICv2 153 Level     uart-pl011
IPI0:       100        200        300        400       Rescheduling interrupts
";

    #[test]
    fn test_finds_completion_line() {
        let irq = parse_interrupts(CLEAN, &DiscoveryConfig::default()).unwrap();
        assert_eq!(irq, 57);
    }

    #[test]
    fn test_kernel_spi_driver_conflicts() {
        let text = format!(
            "{} 58:   1   0   0   0   GICv2 150 Level   fe204000.spi\n",
            CLEAN
        );
        match parse_interrupts(&text, &DiscoveryConfig::default()) {
            Err(DiscoveryError::Conflict { controller, irq }) => {
                assert_eq!(controller, "fe204000.spi");
                assert_eq!(irq, 58);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_missing_line() {
        let text = " 11:   1   GICv2  30 Level   arch_timer\n";
        assert!(matches!(
            parse_interrupts(text, &DiscoveryConfig::default()),
            Err(DiscoveryError::NotFound(_))
        ));
    }

    #[test]
    fn test_dots_match_literally() {
        let text = " 40:   1   GICv2  30 Level   fe204a00xspi\n";
        assert!(parse_interrupts(text, &DiscoveryConfig::default()).is_err());
    }

    #[test]
    fn test_configured_irq_skips_proc() {
        let config = DiscoveryConfig {
            proc_interrupts: "/nonexistent".to_string(),
            irq: Some(99),
            ..DiscoveryConfig::default()
        };
        assert_eq!(discover(&config).unwrap(), 99);
    }

    #[test]
    fn test_unreadable_proc() {
        let config = DiscoveryConfig {
            proc_interrupts: "/nonexistent/interrupts".to_string(),
            ..DiscoveryConfig::default()
        };
        assert!(matches!(discover(&config), Err(DiscoveryError::Read { .. })));
    }
}
