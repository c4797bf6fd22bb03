//! Helper subprocess main entry point.
//!
//! This module runs when `visionpool helper` is invoked. It builds an
//! analyzer from the command line and serves analyze requests from the
//! parent until told to exit.

use super::ipc::{LineReader, LineWriter};
use super::protocol::{HelperRequest, HelperResponse};
use crate::analysis::{AnalysisSpec, Analyzer};
use crate::error::{PoolError, Result};
use std::io::{Read, Write};
use tracing::{debug, error, trace};

/// Helper main loop.
///
/// Announces readiness, then answers each analyze request with exactly one
/// result or error. Returns the number of requests served once the parent
/// sends exit or closes the pipe.
pub fn helper_loop<R, W, A>(
    reader: &mut LineReader<R>,
    writer: &mut LineWriter<W>,
    analyzer: &mut A,
) -> Result<u64>
where
    R: Read,
    W: Write,
    A: Analyzer + ?Sized,
{
    writer.write_line(&HelperResponse::Ready.to_line()?)?;

    let mut served = 0u64;
    loop {
        let request = match reader.read_line()? {
            None => return Ok(served),
            Some(line) if line.trim().is_empty() => continue,
            Some(line) => HelperRequest::from_line(line)
                .map_err(|e| PoolError::Helper(format!("Invalid request: {}", e)))?,
        };

        match request {
            HelperRequest::Exit => return Ok(served),
            HelperRequest::Analyze {
                batch,
                sequence_id,
                frame,
            } => {
                trace!(batch, sequence_id, "Analyzing frame");
                let response = match analyzer.analyze(frame) {
                    Ok(output) => HelperResponse::result(batch, sequence_id, output),
                    Err(e) => HelperResponse::error(batch, sequence_id, e.to_string()),
                };
                writer.write_line(&response.to_line()?)?;
                served += 1;
            }
        }
    }
}

/// Run the helper subprocess main function.
///
/// Never returns: exits 0 after a clean shutdown, 1 on protocol or pipe
/// errors.
pub fn run_helper_main(spec: AnalysisSpec, worker_id: usize) -> ! {
    // Ignore SIGPIPE; a vanished parent shows up as a write error instead.
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        )
        .ok();
    }

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut reader = LineReader::new(stdin.lock());
    let mut writer = LineWriter::new(stdout.lock());
    let mut analyzer = spec.build();

    debug!(worker_id, analyzer = %spec.kind, "Helper started");
    match helper_loop(&mut reader, &mut writer, &mut analyzer) {
        Ok(served) => {
            debug!(worker_id, served, "Helper exiting");
            std::process::exit(0)
        }
        Err(e) => {
            error!(worker_id, error = %e, "Helper failed");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AnalyzerKind;
    use crate::frame::Frame;
    use std::io::Cursor;

    fn run(input: String, spec: AnalysisSpec) -> (Result<u64>, Vec<HelperResponse>) {
        let mut reader = LineReader::new(Cursor::new(input.into_bytes()));
        let mut writer = LineWriter::new(Vec::new());
        let mut analyzer = spec.build();
        let outcome = helper_loop(&mut reader, &mut writer, &mut analyzer);

        let output = String::from_utf8(writer.get_ref().clone()).unwrap();
        let responses = output
            .lines()
            .map(|l| HelperResponse::from_line(l).unwrap())
            .collect();
        (outcome, responses)
    }

    fn analyze_line(batch: u64, sequence_id: usize, frame: Frame) -> String {
        HelperRequest::analyze(batch, sequence_id, frame)
            .to_line()
            .unwrap()
    }

    #[test]
    fn test_ready_then_eof() {
        let (outcome, responses) = run(String::new(), AnalysisSpec::default());
        assert_eq!(outcome.unwrap(), 0);
        assert_eq!(responses.len(), 1);
        assert!(matches!(responses[0], HelperResponse::Ready));
    }

    #[test]
    fn test_analyze_then_exit() {
        let frame = Frame::new(3, 1, 1, vec![1, 2, 3]).unwrap();
        let mut input = analyze_line(4, 2, frame);
        input.push_str(&HelperRequest::Exit.to_line().unwrap());
        // Anything after exit is never read.
        input.push_str("garbage\n");

        let (outcome, responses) = run(input, AnalysisSpec::new(AnalyzerKind::Reverse));
        assert_eq!(outcome.unwrap(), 1);
        assert_eq!(responses.len(), 2);
        match &responses[1] {
            HelperResponse::Result {
                batch,
                sequence_id,
                frame,
            } => {
                assert_eq!((*batch, *sequence_id), (4, 2));
                assert_eq!(frame.data, vec![3, 2, 1]);
            }
            other => panic!("Expected Result, got {:?}", other),
        }
    }

    #[test]
    fn test_analysis_failure_is_reported_not_fatal() {
        let mut input = analyze_line(1, 0, Frame::filled(1, 1, 2, 0));
        input.push_str(&analyze_line(1, 1, Frame::filled(1, 1, 3, 0)));

        let (outcome, responses) = run(input, AnalysisSpec::new(AnalyzerKind::Grayscale));
        assert_eq!(outcome.unwrap(), 2);
        assert!(matches!(
            responses[1],
            HelperResponse::Error { sequence_id: 0, .. }
        ));
        assert!(matches!(
            responses[2],
            HelperResponse::Result { sequence_id: 1, .. }
        ));
    }

    #[test]
    fn test_invalid_request_is_fatal() {
        let (outcome, responses) = run("{\"type\":\"bogus\"}\n".into(), AnalysisSpec::default());
        let err = outcome.unwrap_err();
        assert!(err.to_string().contains("Invalid request"));
        assert_eq!(responses.len(), 1);
    }

    #[test]
    fn test_blank_lines_skipped() {
        let mut input = String::from("\n\n");
        input.push_str(&analyze_line(1, 0, Frame::filled(1, 1, 1, 1)));
        let (outcome, _) = run(input, AnalysisSpec::new(AnalyzerKind::Identity));
        assert_eq!(outcome.unwrap(), 1);
    }
}
