//! JUnit XML report sink.
//!
//! Renders the suite tree as nested `<testsuite>` elements, which Jenkins,
//! GitLab CI and GitHub Actions all accept:
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuites name="All tests" tests="3" failures="1" time="4.200" timestamp="2024-05-01T10:00:00+00:00">
//!   <testsuite name="simple" tests="3" failures="1" time="4.200">
//!     <testsuite name="a_provider" tests="3" failures="1" time="4.200">
//!       <testcase classname="simple.a_provider" name="TestPass" time="1.000"/>
//!       <testcase classname="simple.a_provider" name="TestFail" time="3.200">
//!         <failure message="exit code 1">--- FAIL: TestFail</failure>
//!       </testcase>
//!     </testsuite>
//!   </testsuite>
//! </testsuites>
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use super::{Report, Suite, TestCaseReport};

/// Renders `report` and writes it to `path`, creating parent directories.
pub fn write_report(report: &Report, path: &Path) -> Result<()> {
    let xml = render(report)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    std::fs::write(path, xml)
        .with_context(|| format!("Failed to write JUnit report: {}", path.display()))?;
    Ok(())
}

/// Renders `report` as a JUnit XML document.
pub fn render(report: &Report) -> Result<String> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let root = &report.root;
    let mut testsuites = BytesStart::new("testsuites");
    testsuites.push_attribute(("name", root.name.as_str()));
    push_counts(&mut testsuites, root);
    testsuites.push_attribute(("timestamp", report.started_at.to_rfc3339().as_str()));
    writer.write_event(Event::Start(testsuites))?;

    for suite in &root.suites {
        write_suite(&mut writer, suite, &[])?;
    }

    writer.write_event(Event::End(BytesEnd::new("testsuites")))?;

    Ok(String::from_utf8(writer.into_inner())?)
}

fn push_counts(element: &mut BytesStart<'_>, suite: &Suite) {
    element.push_attribute(("tests", suite.tests.to_string().as_str()));
    element.push_attribute(("failures", suite.failures.to_string().as_str()));
    element.push_attribute(("time", format!("{:.3}", suite.time.as_secs_f64()).as_str()));
}

fn write_suite<W: std::io::Write>(writer: &mut Writer<W>, suite: &Suite, parents: &[&str]) -> Result<()> {
    let mut element = BytesStart::new("testsuite");
    element.push_attribute(("name", suite.name.as_str()));
    push_counts(&mut element, suite);
    writer.write_event(Event::Start(element))?;

    let mut path = parents.to_vec();
    path.push(suite.name.as_str());

    for child in &suite.suites {
        write_suite(writer, child, &path)?;
    }
    for case in &suite.test_cases {
        write_testcase(writer, case, &path.join("."))?;
    }

    writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
    Ok(())
}

fn write_testcase<W: std::io::Write>(
    writer: &mut Writer<W>,
    case: &TestCaseReport,
    classname: &str,
) -> Result<()> {
    let mut testcase = BytesStart::new("testcase");
    testcase.push_attribute(("classname", classname));
    testcase.push_attribute(("name", case.name.as_str()));
    testcase.push_attribute(("time", format!("{:.3}", case.time.as_secs_f64()).as_str()));

    let Some(failure) = &case.failure else {
        writer.write_event(Event::Empty(testcase))?;
        return Ok(());
    };

    writer.write_event(Event::Start(testcase))?;

    let summary = failure.message.lines().next().unwrap_or_default();
    let mut element = BytesStart::new("failure");
    element.push_attribute(("message", summary));
    writer.write_event(Event::Start(element))?;
    writer.write_event(Event::Text(BytesText::new(&failure.message)))?;
    writer.write_event(Event::End(BytesEnd::new("failure")))?;

    writer.write_event(Event::End(BytesEnd::new("testcase")))?;
    Ok(())
}
