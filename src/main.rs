use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use triplegate::{
    BackendError, ConcurrentWriter, Literal, MemoryBackend, NamedNode, PendingUpdate,
    QueryLanguage, QueryResults, RdfPredicate, ReadOptions, Triple, TriplePattern, WriterConfig,
};

#[derive(Parser)]
#[command(name = "triplegate", version, about = "Concurrent buffered writes against an RDF triplestore")]
struct Cli {
    /// Writer configuration file (.yaml, .yml or .json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Concurrent writer threads
    #[arg(long, default_value_t = 4)]
    writers: usize,

    /// Triples written by each thread
    #[arg(long, default_value_t = 2_500)]
    triples: usize,
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    println!("Triplegate v{}", triplegate::version());
    println!("==========================================");
    println!();

    let config = match &cli.config {
        Some(path) => WriterConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => WriterConfig::default(),
    };

    let backend = MemoryBackend::new();
    let writer = Arc::new(ConcurrentWriter::new(config, backend.clone())?);
    writer.add_alias("ex", "http://example.org/");
    writer.set_flush_error_handler(|batch: &[PendingUpdate], error: &BackendError| {
        eprintln!("flush of {} updates failed: {}", batch.len(), error);
    });

    demo_concurrent_writes(&writer, cli.writers, cli.triples)?;
    demo_read_your_writes(&writer)?;
    demo_queries(&writer)?;

    println!("\n=== Statistics ===");
    let stats = writer.stats();
    println!("  Buffered updates:  {}", stats.buffered);
    println!("  Flushes:           {}", stats.flushes);
    println!("  Flushed updates:   {}", stats.flushed_updates);
    println!("  Failed flushes:    {}", stats.failed_flushes);
    if let Some(at) = stats.last_flush_at {
        println!("  Last flush:        {}", at.to_rfc3339());
    }
    println!(
        "  Pool:              {} idle, {} active, {} opened, {} closed",
        stats.pool.idle, stats.pool.active, stats.pool.created, stats.pool.closed
    );

    writer.close()?;
    println!("\n✓ Writer closed, backend holds {} triples", backend.len());
    Ok(())
}

fn item(thread: usize, i: usize) -> anyhow::Result<Triple> {
    Ok(Triple::new(
        NamedNode::new(&format!("http://example.org/thread{}/item{}", thread, i))?,
        RdfPredicate::new("http://purl.org/dc/terms/identifier")?,
        Literal::new_simple_literal(format!("{}-{}", thread, i)),
    ))
}

fn demo_concurrent_writes(
    writer: &Arc<ConcurrentWriter<MemoryBackend>>,
    writers: usize,
    triples: usize,
) -> anyhow::Result<()> {
    println!("=== Demo 1: Concurrent Writes ===");
    let start = Instant::now();

    let handles: Vec<_> = (0..writers)
        .map(|thread| {
            let writer = Arc::clone(writer);
            thread::spawn(move || -> anyhow::Result<()> {
                for i in 0..triples {
                    writer.add(item(thread, i)?, false)?;
                }
                Ok(())
            })
        })
        .collect();

    for handle in handles {
        handle
            .join()
            .map_err(|_| anyhow::anyhow!("writer thread panicked"))??;
    }

    println!(
        "✓ {} threads buffered {} triples in {:?} ({} still buffered)",
        writers,
        writers * triples,
        start.elapsed(),
        writer.buffer_size()
    );
    let flushed = writer.flush_buffer()?;
    println!("✓ Forced flush committed {} updates", flushed);
    Ok(())
}

fn demo_read_your_writes(writer: &ConcurrentWriter<MemoryBackend>) -> anyhow::Result<()> {
    println!("\n=== Demo 2: Read Your Writes ===");
    let added = item(0, usize::MAX)?;
    let removed = item(0, 0)?;

    writer.add(added.clone(), false)?;
    writer.delete(removed.clone(), false)?;
    println!("  Buffered: {} updates", writer.buffer_size());

    let subject = |triple: &Triple| TriplePattern::new(Some(triple.subject.clone()), None, None);
    let sees_added = !writer.find_triples(&subject(&added), &ReadOptions::new())?.is_empty();
    let sees_removed = !writer.find_triples(&subject(&removed), &ReadOptions::new())?.is_empty();
    println!("✓ Unflushed add visible: {}", sees_added);
    println!("✓ Unflushed delete masked: {}", !sees_removed);
    Ok(())
}

fn demo_queries(writer: &ConcurrentWriter<MemoryBackend>) -> anyhow::Result<()> {
    println!("\n=== Demo 3: Aliased Queries ===");
    writer.flush_buffer()?;

    let query = "<http://example.org/thread1/item7> dcterms:identifier ?id";
    match writer.query(query, &QueryLanguage::TriplePattern)? {
        QueryResults::Bindings { variables, rows } => {
            println!("  {}", query);
            for row in rows {
                let values: Vec<String> = row
                    .iter()
                    .map(|value| value.as_ref().map_or_else(|| "-".to_string(), |v| v.to_string()))
                    .collect();
                println!("  {:?} = {:?}", variables, values);
            }
        }
        other => println!("  {:?}", other),
    }

    let count = writer.count_triples(&TriplePattern::any(), &ReadOptions::new())?;
    let sample = writer.find_triples(&TriplePattern::any(), &ReadOptions::new().with_limit(3))?;
    println!("✓ {} triples stored, first {}:", count, sample.len());
    for triple in sample {
        println!("    {}", triple);
    }
    Ok(())
}
