//! Plain-text rendering of job listings.

use gosu_types::{JobList, TaskInfo};

struct Row {
    namespace: String,
    status: String,
    error: String,
    cpu: String,
    mem: String,
    pids: String,
}

fn flatten(info: &TaskInfo, depth: usize, rows: &mut Vec<Row>) {
    let indent = "  ".repeat(depth);
    let name = if info.namespace.is_empty() {
        "-".to_string()
    } else {
        info.namespace.clone()
    };
    let (cpu, mem, pids) = if info.report.is_zero() {
        (String::new(), String::new(), String::new())
    } else {
        (
            format!("{:.1}%", info.report.cpu),
            format!("{:.1}MB", info.report.mem / 1024.0 / 1024.0),
            info.report
                .pid
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(","),
        )
    };
    rows.push(Row {
        namespace: format!("{indent}{name}"),
        status: format!("{} {}", info.status.icon, info.status.code),
        error: info.status.error.clone(),
        cpu,
        mem,
        pids,
    });
    for child in &info.children {
        flatten(child, depth + 1, rows);
    }
}

/// Render the listing as a fixed-width table, one row per worker.
pub fn render(list: &JobList) -> String {
    if list.jobs.is_empty() {
        return "no jobs\n".to_string();
    }

    let mut rows = Vec::new();
    for job in &list.jobs {
        flatten(&job.main, 0, &mut rows);
    }

    let headers = ["TASK", "STATUS", "CPU", "MEM", "PIDS", "ERROR"];
    let cells: Vec<[&str; 6]> = rows
        .iter()
        .map(|r| {
            [
                r.namespace.as_str(),
                r.status.as_str(),
                r.cpu.as_str(),
                r.mem.as_str(),
                r.pids.as_str(),
                r.error.as_str(),
            ]
        })
        .collect();

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &cells {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.chars().count());
        }
    }

    let mut out = String::new();
    let mut push_row = |cols: &[&str]| {
        for (i, col) in cols.iter().enumerate() {
            out.push_str(col);
            if i + 1 < cols.len() {
                let pad = widths[i].saturating_sub(col.chars().count()) + 2;
                out.push_str(&" ".repeat(pad));
            }
        }
        out.push('\n');
    };

    push_row(&headers);
    for row in &cells {
        push_row(&row[..]);
    }
    out
}
