use tui::{
    backend::Backend,
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Span, Spans},
    widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph, Wrap},
    Frame,
};

use crate::app::{ActiveSession, App, FormField, LoginField, LoginForm, Severity, TaskForm};

pub fn draw<B: Backend>(f: &mut Frame<B>, app: &App) {
    match &app.session {
        None => draw_login(f, &app.login),
        Some(active) => {
            draw_tasks(f, active);
            if let Some(form) = &active.form {
                draw_form(f, form);
            }
        }
    }
}

fn draw_login<B: Backend>(f: &mut Frame<B>, login: &LoginForm) {
    let area = centered(f.size(), 60, 13);
    let title = if login.sign_up { "Sign up" } else { "Sign in" };

    let mut lines = vec![
        Spans::from(""),
        field_line("Email", &login.email, login.focus == LoginField::Email),
        Spans::from(""),
        field_line(
            "Password",
            &"*".repeat(login.password.chars().count()),
            login.focus == LoginField::Password,
        ),
        Spans::from(""),
    ];
    if login.busy {
        lines.push(Spans::from(Span::styled(
            "Working...",
            Style::default().fg(Color::Yellow),
        )));
    } else if let Some((severity, message)) = &login.alert {
        let color = match severity {
            Severity::Success => Color::Green,
            Severity::Error => Color::Red,
        };
        lines.push(Spans::from(Span::styled(
            message.as_str(),
            Style::default().fg(color),
        )));
    } else {
        lines.push(Spans::from(""));
    }
    lines.push(Spans::from(""));
    let switch = if login.sign_up {
        "Ctrl+T: have an account? sign in"
    } else {
        "Ctrl+T: no account? sign up"
    };
    lines.push(Spans::from(Span::styled(
        format!("Enter: {}  Tab: next field  {switch}  Esc: quit", title.to_lowercase()),
        Style::default().fg(Color::DarkGray),
    )));

    let paragraph = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title(title))
        .wrap(Wrap { trim: false });
    f.render_widget(Clear, area);
    f.render_widget(paragraph, area);
}

fn draw_tasks<B: Backend>(f: &mut Frame<B>, active: &ActiveSession) {
    let banner_height = if active.banner.is_some() { 3 } else { 0 };
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints(
            [
                Constraint::Length(3),
                Constraint::Length(banner_height),
                Constraint::Min(3),
                Constraint::Length(1),
                Constraint::Length(1),
            ]
            .as_ref(),
        )
        .split(f.size());

    let live = if active.sync.is_live() {
        Span::styled(" live ", Style::default().fg(Color::Black).bg(Color::Green))
    } else {
        Span::styled(" offline ", Style::default().fg(Color::Black).bg(Color::DarkGray))
    };
    let mut title = vec![
        Span::styled("tasksync", Style::default().fg(Color::Yellow)),
        Span::raw("  "),
        Span::styled(active.email.as_str(), Style::default().fg(Color::LightBlue)),
        Span::raw("  "),
        live,
    ];
    let reconciler = active.sync.reconciler();
    if reconciler.is_ready() && reconciler.is_loading() {
        title.push(Span::styled(" syncing...", Style::default().fg(Color::Yellow)));
    }
    let header = Paragraph::new(Spans::from(title))
    .block(Block::default().borders(Borders::ALL))
    .alignment(Alignment::Left);
    f.render_widget(header, chunks[0]);

    if let Some(banner) = &active.banner {
        let banner = Paragraph::new(Spans::from(Span::styled(
            banner.as_str(),
            Style::default().fg(Color::Red),
        )))
        .block(Block::default().borders(Borders::ALL).title("error"));
        f.render_widget(banner, chunks[1]);
    }

    let tasks = active.sync.tasks();
    let list_block = Block::default().borders(Borders::ALL).title("My tasks");
    if !reconciler.is_ready() {
        f.render_widget(
            Paragraph::new("Loading tasks...").block(list_block),
            chunks[2],
        );
    } else if tasks.is_empty() {
        f.render_widget(
            Paragraph::new("No tasks yet. Press n to create one.")
                .alignment(Alignment::Center)
                .block(list_block),
            chunks[2],
        );
    } else {
        let items: Vec<ListItem> = tasks
            .iter()
            .map(|task| {
                let (check, title_style) = if task.is_completed {
                    (
                        "[x] ",
                        Style::default()
                            .fg(Color::DarkGray)
                            .add_modifier(Modifier::CROSSED_OUT),
                    )
                } else {
                    ("[ ] ", Style::default().fg(Color::White))
                };
                let mut lines = vec![Spans::from(vec![
                    Span::raw(check),
                    Span::styled(task.title.as_str(), title_style),
                ])];
                if let Some(description) = &task.description {
                    lines.push(Spans::from(Span::styled(
                        format!("    {description}"),
                        Style::default().fg(Color::LightBlue),
                    )));
                }
                ListItem::new(lines)
            })
            .collect();
        let list = List::new(items)
            .block(list_block)
            .highlight_style(Style::default().add_modifier(Modifier::BOLD))
            .highlight_symbol("> ");
        let mut state = ListState::default();
        state.select(Some(active.selected));
        f.render_stateful_widget(list, chunks[2], &mut state);
    }

    if let Some(error) = &active.inline_error {
        f.render_widget(
            Paragraph::new(Spans::from(Span::styled(
                error.as_str(),
                Style::default().fg(Color::Red),
            ))),
            chunks[3],
        );
    }

    f.render_widget(
        Paragraph::new(Spans::from(Span::styled(
            "n new  e edit  space done  d delete  r reload  L sign out  q quit",
            Style::default().fg(Color::DarkGray),
        ))),
        chunks[4],
    );
}

fn draw_form<B: Backend>(f: &mut Frame<B>, form: &TaskForm) {
    let area = centered(f.size(), 70, 11);
    let title = if form.editing.is_some() {
        "Edit task"
    } else {
        "New task"
    };
    let status = if form.is_saving() {
        Spans::from(Span::styled("Saving...", Style::default().fg(Color::Yellow)))
    } else if let Some(error) = &form.error {
        Spans::from(Span::styled(error.as_str(), Style::default().fg(Color::Red)))
    } else {
        Spans::from("")
    };
    let lines = vec![
        Spans::from(""),
        field_line("Title", &form.title, form.focus == FormField::Title),
        Spans::from(""),
        field_line(
            "Description",
            &form.description,
            form.focus == FormField::Description,
        ),
        Spans::from(""),
        status,
        Spans::from(""),
        Spans::from(Span::styled(
            "Enter: save  Tab: next field  Esc: cancel",
            Style::default().fg(Color::DarkGray),
        )),
    ];
    let paragraph = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title(title))
        .wrap(Wrap { trim: false });
    f.render_widget(Clear, area);
    f.render_widget(paragraph, area);
}

fn field_line<'a>(label: &'a str, value: &str, focused: bool) -> Spans<'a> {
    let label_style = if focused {
        Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD)
    } else {
        Style::default()
    };
    let cursor = if focused { "_" } else { "" };
    Spans::from(vec![
        Span::styled(format!("{label:>12}: "), label_style),
        Span::raw(format!("{value}{cursor}")),
    ])
}

fn centered(area: Rect, width: u16, height: u16) -> Rect {
    let width = width.min(area.width);
    let height = height.min(area.height);
    Rect {
        x: area.x + (area.width - width) / 2,
        y: area.y + (area.height - height) / 2,
        width,
        height,
    }
}
