//! Stage-board wire protocol.
//!
//! ASCII lines terminated by `\r\n`. Every command gets exactly one reply
//! line: `OK`, a value for queries, or `ERR <code> <message>`.
//!
//! | Command | Meaning | Reply |
//! |---|---|---|
//! | `VE?` | identify | `SCOPE-STAGE <firmware>` |
//! | `MA <x> <y> <z>` | move absolute | `OK` |
//! | `MR <dir> <steps> <stop> <disable>` | move relative | `OK` |
//! | `MS?` | motion status | `1` moving, `0` idle |
//! | `TP?` | position | `<x> <y> <z>` |
//! | `LS?` | limit switches of last move | `<x> <y> <z>` as 0/1 |
//! | `SI <micros>` | step interval | `OK` |
//! | `MO` | motors off | `OK` |
//! | `NP <name>` | preset move | `OK` |
//! | `LED <led> <level>` | illumination | `OK` |
//! | `ST?` | board status | `<volts> <celsius> <humidity> <firmware>` |

use std::time::Duration;

use scope_core::error::{DriverError, DriverErrorKind, DriverResult};
use scope_core::types::{BoardStatus, Led, LimitFlags, NamedPosition, StageDirection, StagePosition};

pub(crate) const DRIVER_TYPE: &str = "serial_stage";

/// Prefix of the identification reply.
pub const IDENT_PREFIX: &str = "SCOPE-STAGE";

fn protocol_error(message: String) -> DriverError {
    DriverError::new(DRIVER_TYPE, DriverErrorKind::Protocol, message)
}

/// Board code for a relative-move direction.
pub fn direction_code(direction: StageDirection) -> &'static str {
    match direction {
        StageDirection::Up => "U",
        StageDirection::Down => "D",
        StageDirection::Left => "L",
        StageDirection::Right => "R",
        StageDirection::FocusUp => "FU",
        StageDirection::FocusDown => "FD",
    }
}

/// Board code for an LED.
pub fn led_code(led: Led) -> &'static str {
    match led {
        Led::Fluorescent => "F",
        Led::Brightfield => "B",
    }
}

/// Board name of a preset position.
pub fn preset_code(position: NamedPosition) -> &'static str {
    match position {
        NamedPosition::Loading => "LOADING",
        NamedPosition::Home => "HOME",
        NamedPosition::TestTarget => "TEST_TARGET",
        NamedPosition::SlideCenter => "SLIDE_CENTER",
        NamedPosition::ZHome => "Z_HOME",
        NamedPosition::ZDown => "Z_DOWN",
    }
}

pub(crate) fn move_absolute(target: StagePosition) -> String {
    format!("MA {} {} {}", target.x, target.y, target.z)
}

pub(crate) fn move_relative(
    direction: StageDirection,
    steps: u32,
    stop_on_limit: bool,
    disable_after: bool,
) -> String {
    format!(
        "MR {} {} {} {}",
        direction_code(direction),
        steps,
        u8::from(stop_on_limit),
        u8::from(disable_after)
    )
}

pub(crate) fn step_interval(interval: Duration) -> String {
    let micros = u32::try_from(interval.as_micros()).unwrap_or(u32::MAX);
    format!("SI {}", micros)
}

pub(crate) fn set_led(led: Led, level: u8) -> String {
    format!("LED {} {}", led_code(led), level)
}

/// Split an `ERR` reply into a driver error, pass anything else through.
pub fn check_reply(reply: &str) -> DriverResult<&str> {
    let Some(rest) = reply.strip_prefix("ERR") else {
        return Ok(reply);
    };
    let rest = rest.trim();
    let (code, message) = rest.split_once(' ').unwrap_or((rest, ""));
    let kind = match code {
        "LIMIT" => DriverErrorKind::Limit,
        "RANGE" | "ARG" => DriverErrorKind::InvalidParameter,
        "BUSY" => DriverErrorKind::Timeout,
        _ => DriverErrorKind::Hardware,
    };
    Err(DriverError::new(
        DRIVER_TYPE,
        kind,
        format!("board error {}: {}", code, message.trim()),
    ))
}

/// Expect a plain `OK`.
pub fn expect_ok(reply: &str) -> DriverResult<()> {
    if check_reply(reply)? == "OK" {
        Ok(())
    } else {
        Err(protocol_error(format!("expected OK, got '{}'", reply)))
    }
}

fn fields<'a, const N: usize>(reply: &'a str, what: &str) -> DriverResult<[&'a str; N]> {
    let parts: Vec<&str> = check_reply(reply)?.split_whitespace().collect();
    parts
        .try_into()
        .map_err(|_| protocol_error(format!("malformed {} reply '{}'", what, reply)))
}

fn number<T: std::str::FromStr>(field: &str, what: &str) -> DriverResult<T> {
    field
        .parse()
        .map_err(|_| protocol_error(format!("bad {} value '{}'", what, field)))
}

/// Parse a `TP?` reply.
pub fn parse_position(reply: &str) -> DriverResult<StagePosition> {
    let [x, y, z] = fields::<3>(reply, "position")?;
    Ok(StagePosition::new(
        number(x, "position")?,
        number(y, "position")?,
        number(z, "position")?,
    ))
}

/// Parse an `LS?` reply.
pub fn parse_limits(reply: &str) -> DriverResult<LimitFlags> {
    let [x, y, z] = fields::<3>(reply, "limit")?;
    let flag = |f: &str| -> DriverResult<bool> {
        match f {
            "0" => Ok(false),
            "1" => Ok(true),
            other => Err(protocol_error(format!("bad limit flag '{}'", other))),
        }
    };
    Ok(LimitFlags {
        x: flag(x)?,
        y: flag(y)?,
        z: flag(z)?,
    })
}

/// Parse an `MS?` reply. True while moving.
pub fn parse_moving(reply: &str) -> DriverResult<bool> {
    match check_reply(reply)? {
        "1" => Ok(true),
        "0" => Ok(false),
        other => Err(protocol_error(format!("bad motion status '{}'", other))),
    }
}

/// Parse an `ST?` reply.
pub fn parse_status(reply: &str) -> DriverResult<BoardStatus> {
    let [volts, celsius, humidity, firmware] = fields::<4>(reply, "status")?;
    Ok(BoardStatus {
        battery_voltage: number(volts, "battery")?,
        temperature: number(celsius, "temperature")?,
        humidity: number(humidity, "humidity")?,
        firmware_version: number(firmware, "firmware")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_motion_commands() {
        assert_eq!(move_absolute(StagePosition::new(-5, 10, 0)), "MA -5 10 0");
        assert_eq!(
            move_relative(StageDirection::FocusDown, 40, true, false),
            "MR FD 40 1 0"
        );
        assert_eq!(step_interval(Duration::from_micros(500)), "SI 500");
        assert_eq!(set_led(Led::Brightfield, 60), "LED B 60");
    }

    #[test]
    fn parses_queries() {
        assert_eq!(
            parse_position("12 -3 400").unwrap(),
            StagePosition::new(12, -3, 400)
        );
        assert_eq!(
            parse_limits("0 1 0").unwrap(),
            LimitFlags {
                x: false,
                y: true,
                z: false
            }
        );
        assert!(parse_moving("1").unwrap());
        let status = parse_status("7.4 23.5 41 3").unwrap();
        assert_eq!(status.firmware_version, 3);
        assert!((status.battery_voltage - 7.4).abs() < 1e-6);
    }

    #[test]
    fn error_replies_carry_kind() {
        let err = expect_ok("ERR LIMIT y switch closed").unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Limit);
        assert!(err.message.contains("y switch closed"));

        let err = expect_ok("ERR E42").unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Hardware);
    }

    #[test]
    fn malformed_replies_are_protocol_errors() {
        assert_eq!(
            parse_position("1 2").unwrap_err().kind,
            DriverErrorKind::Protocol
        );
        assert_eq!(
            parse_limits("0 2 0").unwrap_err().kind,
            DriverErrorKind::Protocol
        );
        assert_eq!(expect_ok("YES").unwrap_err().kind, DriverErrorKind::Protocol);
    }
}
