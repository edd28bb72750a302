use ratatui::{
    layout::{Constraint, Layout, Rect},
    style::{Color, Style, Stylize as _},
    symbols,
    text::Line,
    widgets::{Block, Borders, LineGauge, Padding, Row, Table},
    Frame,
};
use swarmer::{TorrentView, TorrentViewState};
use tui_logger::{TuiLoggerLevelOutput, TuiLoggerWidget};

pub struct ByteDisplay(pub u64);

impl std::fmt::Display for ByteDisplay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (n, suffix) = scale(self.0);
        write!(f, "{n:.2} {suffix}")
    }
}

pub struct ByteRateDisplay(pub u64);

impl std::fmt::Display for ByteRateDisplay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (n, suffix) = scale(self.0);
        write!(f, "{n:.2} {suffix}/s")
    }
}

fn scale(bytes: u64) -> (f64, &'static str) {
    const KIB: f64 = 1024.0;
    let value = bytes as f64;
    if value > KIB * KIB * KIB {
        (value / (KIB * KIB * KIB), "GiB")
    } else if value > KIB * KIB {
        (value / (KIB * KIB), "MiB")
    } else if value > KIB {
        (value / KIB, "KiB")
    } else {
        (value, "B")
    }
}

fn flags(choking: bool, choked: bool, interested: bool, interesting: bool) -> String {
    // uppercase is the remote side
    let mut out = String::with_capacity(4);
    out.push(if choking { 'c' } else { '-' });
    out.push(if choked { 'C' } else { '-' });
    out.push(if interesting { 'i' } else { '-' });
    out.push(if interested { 'I' } else { '-' });
    out
}

fn render_text_box(frame: &mut Frame, rect: Rect, title: &str, content: impl std::fmt::Display) {
    let block = Block::new().title(title).borders(Borders::all());
    let area = block.inner(rect);
    let text = Line::from(content.to_string());
    frame.render_widget(block, rect);
    frame.render_widget(text, area);
}

fn render_peers_table(frame: &mut Frame, rect: Rect, view: &TorrentView) {
    let widths = [
        Constraint::Length(22),
        Constraint::Length(6),
        Constraint::Length(5),
        Constraint::Length(14),
        Constraint::Length(14),
    ];

    let mut peers = view.peers.clone();
    peers.sort_by_key(|p| std::cmp::Reverse(p.upload_rate.max(p.download_rate)));
    let rows = peers
        .iter()
        .map(|peer| {
            Row::new(vec![
                peer.addr.to_string(),
                if peer.active {
                    flags(peer.choking, peer.choked, peer.interested, peer.interesting)
                } else {
                    "conn".to_string()
                },
                peer.outstanding.to_string(),
                ByteRateDisplay(u64::from(peer.upload_rate)).to_string(),
                ByteRateDisplay(u64::from(peer.download_rate)).to_string(),
            ])
        })
        .collect::<Vec<_>>();

    let table = Table::new(rows, widths).column_spacing(1).header(
        Row::new(vec!["Address", "Flags", "Reqs", "Upload", "Download"])
            .style(Style::new().bold())
            .bottom_margin(1),
    );

    let block = Block::new()
        .title(format!("Peers ({})", view.peers.len()))
        .borders(Borders::all());
    frame.render_widget(table.block(block), rect);
}

fn render_trackers_table(frame: &mut Frame, rect: Rect, view: &TorrentView) {
    let widths = [Constraint::Fill(1), Constraint::Length(32)];
    let rows = view
        .trackers
        .iter()
        .map(|tracker| Row::new(vec![tracker.url.clone(), tracker.status.to_string()]))
        .collect::<Vec<_>>();
    let table = Table::new(rows, widths).column_spacing(1);
    let block = Block::new().title("Trackers").borders(Borders::all());
    frame.render_widget(table.block(block), rect);
}

fn render_progress_bar(frame: &mut Frame, rect: Rect, view: &TorrentView) {
    let gauge = LineGauge::default()
        .block(Block::bordered().title("Progress"))
        .filled_style(Style::new().white().on_black().bold())
        .line_set(symbols::line::THICK)
        .ratio(view.progress.clamp(0.0, 1.0));
    frame.render_widget(gauge, rect);
}

fn render_logs(frame: &mut Frame, rect: Rect) {
    let logger = TuiLoggerWidget::default()
        .block(Block::bordered().title("Logs"))
        .style_error(Style::default().fg(Color::Red))
        .style_debug(Style::default().fg(Color::Green))
        .style_warn(Style::default().fg(Color::Yellow))
        .style_trace(Style::default().fg(Color::Magenta))
        .style_info(Style::default().fg(Color::Cyan))
        .output_separator(':')
        .output_timestamp(Some("%H:%M:%S".to_string()))
        .output_level(Some(TuiLoggerLevelOutput::Abbreviated))
        .output_target(true)
        .output_file(false)
        .output_line(false)
        .style(Style::default().fg(Color::White));
    frame.render_widget(logger, rect);
}

pub fn render(frame: &mut Frame, view: &TorrentView) {
    let block = Block::new()
        .borders(Borders::all())
        .title("swarmer")
        .padding(Padding::uniform(1));
    let area = block.inner(frame.area());

    let [top, bottom] =
        Layout::vertical([Constraint::Ratio(1, 2), Constraint::Ratio(1, 2)]).areas(area);
    let [top_left, top_right] =
        Layout::horizontal([Constraint::Ratio(1, 2), Constraint::Ratio(1, 2)]).areas(top);

    let [tl_name, tl_size, tl_rates, tl_trackers, tl_status, tl_progress] = Layout::vertical([
        Constraint::Length(3),
        Constraint::Length(3),
        Constraint::Length(3),
        Constraint::Fill(1),
        Constraint::Length(3),
        Constraint::Length(3),
    ])
    .areas(top_left);

    frame.render_widget(&block, frame.area());
    render_text_box(frame, tl_name, "Name", view.info.name());
    render_text_box(
        frame,
        tl_size,
        "Size",
        format!(
            "{} in {} file(s), {} pieces",
            ByteDisplay(view.info.total_size()),
            view.info.files().len(),
            view.info.pieces_count()
        ),
    );
    render_text_box(
        frame,
        tl_rates,
        "Transfer",
        format!(
            "up {} ({}) down {} ({})",
            ByteRateDisplay(u64::from(view.stats.upload_rate)),
            ByteDisplay(view.stats.upload),
            ByteRateDisplay(u64::from(view.stats.download_rate)),
            ByteDisplay(view.stats.download),
        ),
    );
    render_trackers_table(frame, tl_trackers, view);
    render_text_box(
        frame,
        tl_status,
        "Status",
        match view.state {
            TorrentViewState::Downloading => format!("downloading, {} pieces left", view.needed),
            TorrentViewState::Seeding => "seeding".to_string(),
            TorrentViewState::Stopped => "stopped".to_string(),
            TorrentViewState::Failed => "failed".to_string(),
        },
    );
    render_progress_bar(frame, tl_progress, view);
    render_peers_table(frame, top_right, view);
    render_logs(frame, bottom);
}
