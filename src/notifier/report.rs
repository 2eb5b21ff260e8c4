use chrono::{Local, Utc};
use serde_json::Value;
use std::fmt::Write;
use tracing::warn;

use crate::error::{PipelineError, Result};

const MAX_CHART_SKILLS: usize = 15;

/// One bar in the skill chart. Percentage is relative to the most
/// frequent skill so the largest bar always fills the row.
#[derive(Debug, Clone, PartialEq)]
pub struct SkillBar {
    pub name: String,
    pub count: u64,
    pub percentage: u64,
}

/// Everything the HTML report needs, extracted from the analysis document.
#[derive(Debug, Clone)]
pub struct ReportData {
    pub report_date: String,
    pub analyzed_at: String,
    pub total_jobs: usize,
    pub jobs: Vec<Value>,
    pub skill_chart: Vec<SkillBar>,
    pub top_skills: Vec<String>,
    pub trending_skills: Vec<String>,
    pub recommendation: String,
}

impl ReportData {
    pub fn from_analysis(analysis: &Value) -> Result<Self> {
        for field in ["analyzed_jobs", "skill_frequency", "insights"] {
            if analysis.get(field).is_none() {
                return Err(Box::new(PipelineError::ValidationError(format!(
                    "analysis document is missing required field '{}'",
                    field
                ))));
            }
        }

        let jobs = analysis["analyzed_jobs"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        let insights = &analysis["insights"];

        let mut skills: Vec<(String, u64)> = analysis["skill_frequency"]
            .as_object()
            .map(|map| {
                map.iter()
                    .map(|(name, count)| (name.clone(), count.as_u64().unwrap_or(0)))
                    .collect()
            })
            .unwrap_or_default();
        skills.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        skills.truncate(MAX_CHART_SKILLS);

        let max_freq = skills.iter().map(|(_, count)| *count).max().unwrap_or(100);
        let skill_chart = skills
            .into_iter()
            .map(|(name, count)| SkillBar {
                name,
                count,
                percentage: ((count as f64 / max_freq.max(1) as f64) * 100.0).round() as u64,
            })
            .collect();

        let string_list = |field: &str| -> Vec<String> {
            match insights.get(field).and_then(Value::as_array) {
                Some(items) => items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect(),
                None => {
                    warn!("insights has no '{}' list; rendering without it", field);
                    Vec::new()
                }
            }
        };

        Ok(Self {
            report_date: Local::now().format("%Y-%m-%d").to_string(),
            analyzed_at: analysis
                .get("analyzed_at")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| Utc::now().to_rfc3339()),
            total_jobs: jobs.len(),
            jobs,
            skill_chart,
            top_skills: string_list("top_skills"),
            trending_skills: string_list("trending_skills"),
            recommendation: insights
                .get("recommendation")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Renders the report as a self-contained HTML page with inline styles,
/// suitable for email clients.
pub fn render_html(data: &ReportData) -> String {
    let mut html = String::with_capacity(16 * 1024);

    write!(
        html,
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>Job Market Report {date}</title>
</head>
<body style="margin:0;padding:0;background:#f4f5f7;font-family:Arial,Helvetica,sans-serif;color:#1d2129;">
<div style="max-width:680px;margin:0 auto;padding:24px;">
<div style="background:#0a66c2;border-radius:8px 8px 0 0;padding:24px;color:#ffffff;">
<h1 style="margin:0;font-size:22px;">Daily Job Market Report</h1>
<p style="margin:8px 0 0;font-size:14px;opacity:0.85;">{date} &middot; {total} postings analyzed</p>
</div>
<div style="background:#ffffff;border-radius:0 0 8px 8px;padding:24px;">
"#,
        date = data.report_date,
        total = data.total_jobs,
    )
    .ok();

    html.push_str("<h2 style=\"font-size:17px;border-bottom:2px solid #0a66c2;padding-bottom:6px;\">Most Requested Skills</h2>\n");
    if data.skill_chart.is_empty() {
        html.push_str("<p style=\"color:#65676b;\">No skill data available.</p>\n");
    } else {
        for bar in &data.skill_chart {
            write!(
                html,
                "<div style=\"margin:6px 0;\">\
                 <span style=\"display:inline-block;width:160px;font-size:13px;vertical-align:middle;\">{name}</span>\
                 <span style=\"display:inline-block;width:340px;background:#e9ebee;border-radius:4px;vertical-align:middle;\">\
                 <span style=\"display:block;width:{pct}%;background:#0a66c2;border-radius:4px;height:14px;\"></span>\
                 </span>\
                 <span style=\"font-size:12px;color:#65676b;margin-left:8px;\">{count}</span>\
                 </div>\n",
                name = escape_html(&bar.name),
                pct = bar.percentage,
                count = bar.count,
            )
            .ok();
        }
    }

    if !data.top_skills.is_empty() || !data.trending_skills.is_empty() {
        html.push_str("<h2 style=\"font-size:17px;border-bottom:2px solid #0a66c2;padding-bottom:6px;\">Insights</h2>\n");
        if !data.top_skills.is_empty() {
            write!(
                html,
                "<p style=\"font-size:14px;\"><strong>Core skills:</strong> {}</p>\n",
                escape_html(&data.top_skills.join(", "))
            )
            .ok();
        }
        if !data.trending_skills.is_empty() {
            write!(
                html,
                "<p style=\"font-size:14px;\"><strong>Trending:</strong> {}</p>\n",
                escape_html(&data.trending_skills.join(", "))
            )
            .ok();
        }
    }

    if !data.recommendation.is_empty() {
        write!(
            html,
            "<h2 style=\"font-size:17px;border-bottom:2px solid #0a66c2;padding-bottom:6px;\">Strategy</h2>\n\
             <p style=\"font-size:14px;line-height:1.6;background:#f0f7ff;border-left:4px solid #0a66c2;padding:12px;\">{}</p>\n",
            escape_html(&data.recommendation)
        )
        .ok();
    }

    html.push_str("<h2 style=\"font-size:17px;border-bottom:2px solid #0a66c2;padding-bottom:6px;\">Postings</h2>\n");
    for job in &data.jobs {
        let text = |field: &str| {
            job.get(field)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let title = escape_html(&text("title"));
        let heading = match job.get("url").and_then(Value::as_str) {
            Some(url) => format!(
                "<a href=\"{}\" style=\"color:#0a66c2;text-decoration:none;\">{}</a>",
                escape_html(url),
                title
            ),
            None => title,
        };
        write!(
            html,
            "<div style=\"border:1px solid #e0e0e0;border-radius:6px;padding:12px;margin:10px 0;\">\
             <p style=\"margin:0;font-size:15px;font-weight:bold;\">{heading}</p>\
             <p style=\"margin:4px 0 0;font-size:13px;color:#65676b;\">{company} &middot; {location}</p>\
             <p style=\"margin:6px 0 0;font-size:13px;line-height:1.5;\">{summary}</p>\
             </div>\n",
            heading = heading,
            company = escape_html(&text("company")),
            location = escape_html(&text("location")),
            summary = escape_html(&text("summary")),
        )
        .ok();
    }

    write!(
        html,
        "<p style=\"margin-top:24px;font-size:11px;color:#90949c;\">Generated {analyzed_at} &middot; {year} Job Pipeline</p>\n\
         </div>\n</div>\n</body>\n</html>\n",
        analyzed_at = escape_html(&data.analyzed_at),
        year = Local::now().format("%Y"),
    )
    .ok();

    html
}
