//! JSON-lines request loop.
//!
//! Each non-blank input line is one [`devcomp_service::Request`]; each gets
//! exactly one response line, in order.

use anyhow::{Context, Result};
use devcomp_service::Service;
use std::io::{BufRead, Write};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServeSummary {
    pub requests: usize,
    pub errors: usize,
}

pub fn serve<R: BufRead, W: Write>(service: &Service, reader: R, mut writer: W) -> Result<ServeSummary> {
    let mut summary = ServeSummary::default();
    for line in reader.lines() {
        let line = line.context("Failed to read request")?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        summary.requests += 1;
        let response = service.handle_line(line);
        if response.is_error() {
            summary.errors += 1;
        }
        writeln!(writer, "{}", response.to_json()).context("Failed to write response")?;
        writer.flush().context("Failed to flush response")?;
    }
    tracing::info!(
        requests = summary.requests,
        errors = summary.errors,
        "input closed"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use devcomp_service::{Response, ServiceConfig, StatusCode};

    #[test]
    fn test_one_response_per_line() {
        let service = Service::new(ServiceConfig::default()).unwrap();
        let input = "{\"request\":\"service_stats\"}\n\n not json\n{\"request\":\"get_shape\",\"handle\":3}\n";
        let mut output = Vec::new();
        let summary = serve(&service, input.as_bytes(), &mut output).unwrap();
        assert_eq!(summary, ServeSummary { requests: 3, errors: 2 });

        let lines: Vec<Response> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert!(matches!(lines[0], Response::ServiceStats { .. }));
        assert!(matches!(
            lines[2],
            Response::Error {
                code: StatusCode::InvalidHandle,
                ..
            }
        ));
    }
}
