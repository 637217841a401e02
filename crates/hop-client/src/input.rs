//! Interactive commands read from stdin

use hop_session::CitySelection;

pub const HELP: &str = "\
commands:
  on [<country> <city>]      connect, to the last or best city by default
  off                        disconnect
  switch <country> <city>    move to another city
  silent                     switch to another server of the current city
  status                     show the session state
  scores                     list cities by measured quality
  logs                       print the daemon log
  cleanlogs                  clear the daemon log
  portal on|off              report a captive portal
  quit                       disconnect and exit";

/// One parsed input line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    On(Option<CitySelection>),
    Off,
    Switch(CitySelection),
    Silent,
    Status,
    Scores,
    Logs,
    CleanLogs,
    Portal(bool),
    Quit,
    Help,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum InputError {
    #[error("unknown command '{0}', try 'help'")]
    Unknown(String),

    #[error("usage: {0}")]
    Usage(&'static str),
}

/// Parse a line; `None` for blank input
pub fn parse_line(line: &str) -> Result<Option<Input>, InputError> {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return Ok(None);
    };
    let rest: Vec<&str> = words.collect();

    let input = match command.to_ascii_lowercase().as_str() {
        "on" | "connect" => match rest.as_slice() {
            [] => Input::On(None),
            _ => Input::On(Some(selection(&rest).ok_or(InputError::Usage("on [<country> <city>]"))?)),
        },
        "off" | "disconnect" => Input::Off,
        "switch" => Input::Switch(selection(&rest).ok_or(InputError::Usage("switch <country> <city>"))?),
        "silent" => Input::Silent,
        "status" => Input::Status,
        "scores" => Input::Scores,
        "logs" => Input::Logs,
        "cleanlogs" => Input::CleanLogs,
        "portal" => match rest.as_slice() {
            ["on"] => Input::Portal(true),
            ["off"] => Input::Portal(false),
            _ => return Err(InputError::Usage("portal on|off")),
        },
        "quit" | "exit" => Input::Quit,
        "help" | "?" => Input::Help,
        other => return Err(InputError::Unknown(other.to_string())),
    };
    Ok(Some(input))
}

/// Country code followed by a city name that may contain spaces
fn selection(words: &[&str]) -> Option<CitySelection> {
    match words {
        [country, city @ ..] if !city.is_empty() => Some(CitySelection::new(country, &city.join(" "))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_line() {
        assert_eq!(parse_line("   "), Ok(None));
    }

    #[test]
    fn test_on_without_city() {
        assert_eq!(parse_line("on"), Ok(Some(Input::On(None))));
        assert_eq!(parse_line("CONNECT"), Ok(Some(Input::On(None))));
    }

    #[test]
    fn test_city_with_spaces() {
        assert_eq!(
            parse_line("switch us New York"),
            Ok(Some(Input::Switch(CitySelection::new("us", "New York"))))
        );
        assert_eq!(
            parse_line("on de Berlin"),
            Ok(Some(Input::On(Some(CitySelection::new("de", "Berlin")))))
        );
    }

    #[test]
    fn test_switch_needs_city() {
        assert_eq!(parse_line("switch de"), Err(InputError::Usage("switch <country> <city>")));
        assert!(parse_line("on de").is_err());
    }

    #[test]
    fn test_portal() {
        assert_eq!(parse_line("portal on"), Ok(Some(Input::Portal(true))));
        assert_eq!(parse_line("portal off"), Ok(Some(Input::Portal(false))));
        assert!(parse_line("portal maybe").is_err());
    }

    #[test]
    fn test_unknown() {
        assert_eq!(parse_line("reboot now"), Err(InputError::Unknown("reboot".to_string())));
    }
}
