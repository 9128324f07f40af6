//! Query, teach, and rate the knowledge cache.

use anyhow::{Context, Result, bail};
use colored::Colorize;

use hope_core::tiers::SaveOutcome;
use hope_core::{AnswerSource, KnowledgeManager, ResponseStrategy, UserContext, UserRole};

use crate::cli::{FeedbackArgs, RateArgs, SaveArgs};
use crate::commands::print_json;

/// Look a question up in every tier.
pub fn query(manager: &KnowledgeManager, question: &str, session: Option<&str>, json: bool) -> Result<()> {
    let result = manager.smart_query(question, session);
    let strategy = manager.strategy(&result);
    // Persist access counters bumped by the lookup
    manager.flush().context("Failed to persist access counts")?;

    if json {
        return print_json(&serde_json::json!({
            "strategy": strategy,
            "result": result,
        }));
    }

    let source = match result.source {
        AnswerSource::Permanent => "permanent".green(),
        AnswerSource::Ordinary => "ordinary".yellow(),
        AnswerSource::Generation => "generation".dimmed(),
        AnswerSource::Disabled => "disabled".red(),
    };
    println!("{} {}  ({} ms)", "Source:".bold(), source, result.elapsed_ms);
    println!("{} {}", "Strategy:".bold(), strategy_label(strategy));

    if let Some(answer) = &result.answer {
        println!("{} {:.0}%", "Confidence:".bold(), result.confidence * 100.0);
        println!();
        println!("{answer}");
    }
    if let Some(skill) = &result.skill_template {
        println!("{} {} ({})", "Skill template:".bold(), skill.name, skill.id.dimmed());
    }
    if let Some(topic) = &result.current_topic {
        println!("{} {}", "Topic:".bold(), topic);
    }
    if !result.references.is_empty() {
        println!();
        println!("{}", "References:".bold());
        for reference in &result.references {
            println!(
                "  {} {:.2} similarity, rated {:.1}  {}",
                "•".cyan(),
                reference.similarity,
                reference.rating,
                reference.id.dimmed()
            );
            println!("    {}", reference.question);
        }
    }
    Ok(())
}

fn strategy_label(strategy: ResponseStrategy) -> colored::ColoredString {
    match strategy {
        ResponseStrategy::DirectAnswer => strategy.as_str().green(),
        ResponseStrategy::TemplateAnswer | ResponseStrategy::ReferenceAnswer => strategy.as_str().yellow(),
        ResponseStrategy::FullGeneration => strategy.as_str().normal(),
    }
}

/// Teach the cache an answer.
pub fn save(manager: &KnowledgeManager, args: SaveArgs, json: bool) -> Result<()> {
    let outcome = manager.learn(&args.question, &args.answer, args.rating, args.session.as_deref());

    if json {
        return print_json(&serde_json::json!({
            "stored": outcome.is_some(),
            "merged": matches!(outcome, Some(SaveOutcome::Merged(_))),
            "id": outcome.as_ref().map(SaveOutcome::id),
        }));
    }

    match outcome {
        Some(SaveOutcome::Inserted(id)) => println!("{} Answer saved  {}", "✓".green(), id.dimmed()),
        Some(SaveOutcome::Merged(id)) => {
            println!("{} Merged into a similar answer  {}", "✓".green(), id.dimmed())
        }
        None if !manager.is_enabled() => println!("{} Knowledge cache is disabled", "!".yellow()),
        None => println!(
            "{} Rating {} is below the learning threshold; answer not stored",
            "!".yellow(),
            args.rating
        ),
    }
    Ok(())
}

/// Rate a cached answer.
pub fn rate(manager: &KnowledgeManager, args: RateArgs, now: chrono::DateTime<chrono::Utc>, json: bool) -> Result<()> {
    let Some(role) = UserRole::from_str(&args.role) else {
        bail!(
            "Unknown role '{}' (expected expert, power_user, regular or new_user)",
            args.role
        );
    };
    let mut user = UserContext::default().with_role(role);
    if let Some(accuracy) = args.accuracy {
        user = user.with_accuracy(accuracy);
    }

    let updated = manager
        .rate_answer(&args.id, args.rating, &user, now)
        .with_context(|| format!("Failed to rate {}", args.id))?;
    manager.ordinary().check_and_promote(manager.permanent());

    if json {
        return print_json(&updated);
    }
    println!(
        "{} Rated {}  average {:.2} over {} rating(s)",
        "✓".green(),
        updated.id.dimmed(),
        updated.average_rating(),
        updated.rating_count
    );
    Ok(())
}

/// Record feedback on a permanent fact.
pub fn feedback(manager: &KnowledgeManager, args: FeedbackArgs, json: bool) -> Result<()> {
    let fact = manager
        .permanent()
        .record_feedback(&args.fact_id, args.positive)
        .with_context(|| format!("Failed to record feedback for {}", args.fact_id))?;

    if json {
        return print_json(&fact);
    }
    let verdict = if args.positive { "positive".green() } else { "negative".red() };
    println!("{} Recorded {} feedback for {}", "✓".green(), verdict, fact.id);
    println!(
        "  +{} / -{}  ({:.0}% negative)",
        fact.positive_feedback,
        fact.negative_feedback,
        fact.negative_ratio() * 100.0
    );
    if !fact.enabled {
        println!("  {} Fact disabled after too much negative feedback", "!".yellow());
    }
    Ok(())
}
