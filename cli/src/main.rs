use std::io::{self, BufRead, Write};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use preppath::auth::{CryptError, UserClaims, generate_token};
use preppath::dashboard::{DashboardView, Screen, ScreenEvent};
use preppath::error::AppResult;
use preppath::generation::GenerationOutcome;
use preppath::generation::practice::PracticeRequest;
use preppath::generation::roadmap::RoadmapRequest;
use preppath::llm::OpenAiClient;
use preppath::model::entity::RoadmapSection;
use preppath::model::{DbConnection, ModelManager};
use preppath::quiz::session::{OptionMark, difficulty_label};
use preppath::quiz::{
    Advance, ExperienceLevel, QuestionCount, QuizResult, QuizSession, SetupForm, TargetRole, Topic,
};
use preppath::service::{DataAccess, Notifier};
use preppath::web::{AuthenticatedUser, UserRole};
use preppath::Config;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(about = "Terminal client for PrepPath interview preparation", long_about = None)]
pub struct Cli {
    /// User to act as
    #[arg(long, global = true, env = "PREPPATH_USER")]
    pub user: Option<Uuid>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Mint a development token for the API
    Token {
        #[arg(long, default_value_t = 24)]
        hours: i64,
        /// Issue a `service_role` token instead of a user one
        #[arg(long, default_value_t = false)]
        service: bool,
    },

    /// Show what the dashboard would show
    Dashboard,

    /// Set up and take a skill assessment
    Quiz {
        #[arg(long)]
        company: Option<String>,
        #[arg(long, default_value = "software engineer")]
        role: TargetRole,
        /// entry, mid or senior. Asked interactively when missing
        #[arg(long)]
        level: Option<ExperienceLevel>,
        /// 5, 10, 15 or 20
        #[arg(long, default_value = "10")]
        count: QuestionCount,
        /// Topics to cover. Defaults to data structures, algorithms and system design
        #[arg(long = "topic")]
        topics: Vec<Topic>,
    },

    /// Learning roadmap
    Roadmap {
        #[command(subcommand)]
        action: RoadmapCommands,
    },

    /// Practice problems
    Problems {
        #[command(subcommand)]
        action: ProblemCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum RoadmapCommands {
    Show,
    Generate {
        #[arg(long)]
        role: String,
        #[arg(long)]
        company: Option<String>,
        /// YYYY-MM-DD
        #[arg(long)]
        interview_date: Option<String>,
    },
    Done {
        topic_id: Uuid,
        /// Mark the topic as not completed
        #[arg(long, default_value_t = false)]
        undo: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum ProblemCommands {
    List,
    Generate {
        #[arg(long)]
        role: String,
        #[arg(long)]
        company: Option<String>,
        #[arg(long, default_value_t = 5)]
        count: u32,
    },
    Done {
        problem_id: Uuid,
        /// File with the submitted solution
        #[arg(long)]
        code: Option<std::path::PathBuf>,
        #[arg(long, default_value_t = false)]
        undo: bool,
    },
}

#[derive(Debug, Default)]
struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn success(&self, message: &str) {
        eprintln!("[ok] {message}");
    }

    fn info(&self, message: &str) {
        eprintln!("[..] {message}");
    }

    fn error(&self, message: &str) {
        eprintln!("[!!] {message}");
    }
}

/// One trimmed line, `None` once the input is closed.
fn read_answer<R: BufRead>(input: &mut R) -> io::Result<Option<String>> {
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}

fn prompt<R: BufRead>(label: &str, input: &mut R) -> io::Result<Option<String>> {
    print!("{label} ");
    io::stdout().flush()?;
    read_answer(input)
}

fn print_dashboard(view: &DashboardView) {
    match view {
        DashboardView::NeedsAssessment => {
            println!("No assessment yet. Run `preppath-cli quiz` to take one.");
        }
        DashboardView::NeedsRoadmap { assessment } => {
            println!("Latest assessment score: {}%", assessment.score);
            println!("No roadmap yet. Run `preppath-cli roadmap generate --role <role>`.");
        }
        DashboardView::Ready {
            assessment,
            roadmap,
            problems,
            progress,
        } => {
            println!("Latest assessment score: {}%", assessment.score);
            println!(
                "Overall progress: {}% ({}/{} topics)",
                progress.percentage, progress.completed, progress.total
            );
            print_roadmap(roadmap);
            let done = problems.iter().filter(|p| p.completed).count();
            println!("Practice problems: {done}/{} solved", problems.len());
        }
    }
}

fn print_roadmap(sections: &[RoadmapSection]) {
    for section in sections {
        println!("\n{} ({}/{})", section.title, section.completed, section.total);
        for topic in &section.topics {
            let mark = if topic.completed { "x" } else { " " };
            println!(
                "  [{mark}] {} ({}) {}",
                topic.name,
                difficulty_label(topic.difficulty),
                topic.id
            );
        }
    }
}

fn print_question(session: &QuizSession) {
    let question = session.current();
    println!(
        "\nQuestion {}/{} ({}%) - {} - {}",
        session.index() + 1,
        session.len(),
        session.progress(),
        question.topic,
        difficulty_label(question.difficulty)
    );
    println!("{}", question.question);

    for (idx, option) in question.options.iter().enumerate() {
        let mark = match session.mark(option) {
            OptionMark::Plain => " ",
            OptionMark::Selected => ">",
            OptionMark::Correct => "+",
            OptionMark::Incorrect => "-",
        };
        println!("  {mark} {}. {option}", idx + 1);
    }

    if session.explanation_visible() && !question.explanation.is_empty() {
        println!("  Explanation: {}", question.explanation);
    }
}

#[derive(Debug)]
enum SessionEnd {
    /// Last question answered. The session is now in review.
    Completed(QuizResult),
    ReviewFinished,
    Quit,
}

/// Reads commands until the quiz completes, the review ends, or the user quits.
/// Closed input counts as quitting.
fn drive_session<R: BufRead>(
    session: &mut QuizSession,
    input: &mut R,
    notifier: &dyn Notifier,
) -> io::Result<SessionEnd> {
    loop {
        print_question(session);
        let Some(answer) = prompt("[1-9] answer, n next, p previous, e explanation, q quit >", input)?
        else {
            return Ok(SessionEnd::Quit);
        };

        match answer.as_str() {
            "n" => match session.next() {
                Ok(Advance::Completed(result)) => return Ok(SessionEnd::Completed(result)),
                Ok(Advance::ReviewFinished) => return Ok(SessionEnd::ReviewFinished),
                Ok(Advance::Moved(_)) => {}
                Err(e) => notifier.error(&e.to_string()),
            },
            "p" => {
                session.previous();
            }
            "e" => {
                if let Err(e) = session.toggle_explanation() {
                    notifier.error(&e.to_string());
                }
            }
            "q" => return Ok(SessionEnd::Quit),
            other => {
                let picked = other
                    .parse::<usize>()
                    .ok()
                    .and_then(|n| n.checked_sub(1))
                    .and_then(|n| session.current().options.get(n).cloned());
                match picked {
                    Some(option) => {
                        session.select(&option);
                    }
                    None => notifier.info("Unknown input"),
                }
            }
        }
    }
}

fn pick_level<R: BufRead>(input: &mut R) -> io::Result<Option<ExperienceLevel>> {
    for (idx, level) in ExperienceLevel::ALL.iter().enumerate() {
        println!("  {}. {}", idx + 1, level.label());
    }
    let Some(answer) = prompt("Experience level [1]:", input)? else {
        return Ok(None);
    };
    if answer.is_empty() {
        return Ok(Some(ExperienceLevel::default()));
    }

    let level = answer
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_sub(1))
        .and_then(|n| ExperienceLevel::ALL.get(n).copied())
        .or_else(|| answer.parse().ok());
    Ok(level)
}

fn require_user(user: Option<Uuid>) -> AuthenticatedUser {
    match user {
        Some(id) => AuthenticatedUser::new(id, UserRole::User),
        None => {
            eprintln!("--user (or PREPPATH_USER) is required for this command");
            std::process::exit(2);
        }
    }
}

async fn take_quiz(
    access: &DataAccess,
    actor: &AuthenticatedUser,
    company: Option<String>,
    role: TargetRole,
    level: Option<ExperienceLevel>,
    count: QuestionCount,
    topics: Vec<Topic>,
) -> AppResult<()> {
    let view = access.load_dashboard(actor).await;
    let screen = Screen::Loading
        .on(ScreenEvent::Loaded(view))
        .on(ScreenEvent::StartAssessment);

    let level = match level {
        Some(level) => level,
        None => match pick_level(&mut io::stdin().lock())? {
            Some(level) => level,
            None => {
                access.notifier().error("Unknown experience level");
                return Ok(());
            }
        },
    };
    let company = match company {
        Some(company) => company,
        None => prompt("Target company:", &mut io::stdin().lock())?.unwrap_or_default(),
    };

    let mut form = SetupForm::new(level, company, role, count);
    if !topics.is_empty() {
        for topic in Topic::ALL {
            form.set_topic(topic, topics.contains(&topic));
        }
    }

    let prefs = match form.submit() {
        Ok(prefs) => prefs,
        Err(e) => {
            access.notifier().error(&e.to_string());
            return Ok(());
        }
    };

    access.notifier().info("Generating your assessment...");
    let screen = screen.on(ScreenEvent::SetupSubmitted(prefs.clone()));
    let questions = access.generate_quiz(prefs).await;
    if questions.is_empty() {
        screen.on(ScreenEvent::GenerationFailed("no questions were generated".into()));
        return Ok(());
    }
    let questions = access.save_quiz_questions(actor, questions).await;

    let mut session = match screen.on(ScreenEvent::QuizGenerated(questions)) {
        Screen::Quiz(session) => session.on_complete(|score, _| {
            println!("\nQuiz completed! Your score: {score}%");
        }),
        _ => return Ok(()),
    };

    let end = drive_session(&mut session, &mut io::stdin().lock(), access.notifier())?;
    let SessionEnd::Completed(result) = end else {
        return Ok(());
    };

    // saved before the review so quitting it keeps the result
    if let Some(id) = access
        .save_quiz_results(actor, result.score, &result.responses)
        .await
    {
        access.notifier().success(&format!("Assessment {id} saved"));
    }

    println!("\nReviewing your answers.");
    drive_session(&mut session, &mut io::stdin().lock(), access.notifier())?;
    Ok(())
}

#[tokio::main]
async fn main() -> AppResult<()> {
    let _ = dotenvy::dotenv();
    let args = Cli::parse();
    let config = Config::get_or_init(cfg!(debug_assertions)).await;

    if let Commands::Token { hours, service } = args.command {
        let (id, role) = if service {
            (args.user.unwrap_or(Uuid::nil()), UserRole::Service)
        } else {
            (require_user(args.user).user_id(), UserRole::User)
        };

        let mut claims = UserClaims::new(id, Some(role.to_string()), chrono::Duration::hours(hours));
        if let Some(aud) = config.app().jwt_audience() {
            claims = claims.with_audience(aud);
        }
        let token = generate_token(claims, config.app().jwt()).map_err(CryptError::from)?;
        println!("{token}");
        return Ok(());
    }

    preppath::setup_trace();
    let database_uri =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| config.app().database_uri().to_string());
    let mm = ModelManager::new(DbConnection::connect(&database_uri)?);
    let llm = Arc::new(OpenAiClient::from_config(config.llm()));
    let access = DataAccess::new(mm, llm, Arc::new(ConsoleNotifier));
    let actor = require_user(args.user);

    match args.command {
        Commands::Token { .. } => {}

        Commands::Dashboard => {
            print_dashboard(&access.load_dashboard(&actor).await);
        }

        Commands::Quiz {
            company,
            role,
            level,
            count,
            topics,
        } => take_quiz(&access, &actor, company, role, level, count, topics).await?,

        Commands::Roadmap { action } => match action {
            RoadmapCommands::Show => {
                if let Some(sections) = access.fetch_user_roadmap(&actor).await {
                    if sections.is_empty() {
                        println!("No roadmap yet.");
                    }
                    print_roadmap(&sections);
                }
            }
            RoadmapCommands::Generate {
                role,
                company,
                interview_date,
            } => {
                let Some(assessment) = access.check_user_assessment(&actor).await else {
                    access.notifier().error("Take an assessment first");
                    return Ok(());
                };

                let request = RoadmapRequest {
                    user_id: Some(actor.user_id()),
                    assessment_id: Some(assessment.id),
                    target_role: Some(role),
                    target_company: company,
                    interview_date,
                };
                if let GenerationOutcome::PersistenceFailed { generated, .. } =
                    access.generate_ai_roadmap(&actor, request.clone()).await
                {
                    access.notifier().info("Retrying to save the generated roadmap...");
                    access.persist_roadmap(&actor, request, &generated).await;
                }
            }
            RoadmapCommands::Done { topic_id, undo } => {
                if access.update_topic_progress(&actor, topic_id, !undo).await {
                    access.notifier().success("Progress updated");
                }
            }
        },

        Commands::Problems { action } => match action {
            ProblemCommands::List => {
                for problem in access
                    .fetch_user_practice_problems(&actor)
                    .await
                    .unwrap_or_default()
                {
                    let mark = if problem.completed { "x" } else { " " };
                    println!(
                        "[{mark}] {} ({}, relevance {}) [{}] {}",
                        problem.title,
                        problem.difficulty,
                        problem.company_relevance,
                        problem.tags.join(", "),
                        problem.id
                    );
                }
            }
            ProblemCommands::Generate {
                role,
                company,
                count,
            } => {
                let Some(assessment) = access.check_user_assessment(&actor).await else {
                    access.notifier().error("Take an assessment first");
                    return Ok(());
                };

                let request = PracticeRequest {
                    user_id: Some(actor.user_id()),
                    assessment_id: Some(assessment.id),
                    target_company: company,
                    target_role: Some(role),
                    count: Some(count),
                };
                if let GenerationOutcome::PersistenceFailed { generated, .. } =
                    access.generate_practice_problems(&actor, request).await
                {
                    access.persist_practice_problems(&generated).await;
                }
            }
            ProblemCommands::Done {
                problem_id,
                code,
                undo,
            } => {
                if access.get_practice_problem(&actor, problem_id).await.is_none() {
                    access.notifier().error("Practice problem not found");
                    return Ok(());
                }

                let code = code.map(std::fs::read_to_string).transpose()?;
                if access
                    .update_problem_progress(&actor, problem_id, !undo, code)
                    .await
                {
                    access.notifier().success("Progress updated");
                }
            }
        },
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use preppath::model::entity::QuizQuestion;

    use super::*;

    fn question(answer: &str) -> QuizQuestion {
        QuizQuestion {
            id: None,
            question: "Pick one".into(),
            options: vec!["A".into(), "B".into()],
            correct_answer: answer.into(),
            explanation: "Because".into(),
            difficulty: 2,
            topic: "Algorithms".into(),
        }
    }

    #[test]
    fn closed_input_reads_as_none() {
        let mut input = Cursor::new("first\n");
        assert_eq!(read_answer(&mut input).unwrap().as_deref(), Some("first"));
        assert_eq!(read_answer(&mut input).unwrap(), None);
    }

    #[test]
    fn closed_input_quits_the_session() {
        let mut session = QuizSession::new(vec![question("A")]).unwrap();
        let end = drive_session(&mut session, &mut Cursor::new(""), &ConsoleNotifier).unwrap();
        assert!(matches!(end, SessionEnd::Quit));
    }

    #[test]
    fn session_returns_as_soon_as_completed() {
        let mut session = QuizSession::new(vec![question("A")]).unwrap();
        let mut input = Cursor::new("2\nn\n1\n");

        let end = drive_session(&mut session, &mut input, &ConsoleNotifier).unwrap();
        let SessionEnd::Completed(result) = end else {
            panic!("expected completion, got {end:?}");
        };
        assert_eq!(result.score, 0);
        assert_eq!(result.responses.len(), 1);
        // the review input is still unread
        assert_eq!(read_answer(&mut input).unwrap().as_deref(), Some("1"));

        let end = drive_session(&mut session, &mut Cursor::new("n\n"), &ConsoleNotifier).unwrap();
        assert!(matches!(end, SessionEnd::ReviewFinished));
    }

    #[test]
    fn level_prompt_accepts_index_name_or_default() {
        assert_eq!(
            pick_level(&mut Cursor::new("3\n")).unwrap(),
            Some(ExperienceLevel::Senior)
        );
        assert_eq!(
            pick_level(&mut Cursor::new("mid\n")).unwrap(),
            Some(ExperienceLevel::Mid)
        );
        assert_eq!(
            pick_level(&mut Cursor::new("\n")).unwrap(),
            Some(ExperienceLevel::Entry)
        );
        assert_eq!(pick_level(&mut Cursor::new("9\n")).unwrap(), None);
        assert_eq!(pick_level(&mut Cursor::new("")).unwrap(), None);
    }

    #[test]
    fn quiz_count_must_be_offered() {
        let user = Uuid::new_v4().to_string();
        let parse = |count: &str| {
            Cli::try_parse_from(["preppath-cli", "--user", user.as_str(), "quiz", "--count", count])
        };

        assert!(parse("7").is_err());
        assert!(parse("ten").is_err());
        let Commands::Quiz { count, level, .. } = parse("15").unwrap().command else {
            panic!("expected quiz command");
        };
        assert_eq!(count, QuestionCount::Fifteen);
        assert_eq!(level, None);
    }
}
