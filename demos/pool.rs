use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc::{channel, Receiver, Sender},
        Arc, Mutex, Weak,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Result};
use clap::Parser;
use log::{debug, info};
use rearm::{
    error::Error,
    source::{CompletionSource, Hooks, SourceOptions, Token},
};

/// Drive pooled completion sources from several threads at once.
///
/// Every operation takes a source from a shared pool, arms it with a timeout
/// and hands it to a producer thread which completes it after a short delay.
/// Some producers are slower than the timeout, so both outcomes are exercised.
/// Consumed sources return themselves to the pool.
#[derive(Parser, Debug)]
struct Args {
    /// Number of consumer threads.
    #[arg(short, long, default_value_t = 4)]
    threads: usize,

    /// Operations per consumer thread.
    #[arg(short, long, default_value_t = 1000)]
    iterations: usize,

    /// Timeout for each operation, in microseconds.
    #[arg(long, default_value_t = 500)]
    timeout_us: u64,

    /// Run continuations on the dispatch thread instead of the completer.
    #[arg(long)]
    deferred: bool,
}

type Source = CompletionSource<usize, ReturnToPool>;

struct Pool {
    free: Mutex<Vec<Arc<Source>>>,
    created: AtomicUsize,
    options: SourceOptions,
}

struct ReturnToPool {
    pool: Weak<Pool>,
}

impl Hooks<usize> for ReturnToPool {
    type Data = Instant;

    fn on_consumed(&self, source: &Arc<Source>, completed_at: Option<Instant>) {
        if let Some(at) = completed_at {
            debug!("{} consumed {:?} after completion", source.token(), at.elapsed());
        }

        if source.reset().is_err() {
            return;
        }

        if let Some(pool) = self.pool.upgrade() {
            pool.free.lock().unwrap().push(source.clone());
        }
    }
}

impl Pool {
    fn new(options: SourceOptions) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::new()),
            created: AtomicUsize::new(0),
            options,
        })
    }

    fn get(self: &Arc<Self>) -> Arc<Source> {
        if let Some(source) = self.free.lock().unwrap().pop() {
            return source;
        }

        self.created.fetch_add(1, Ordering::Relaxed);
        CompletionSource::with_options(
            ReturnToPool {
                pool: Arc::downgrade(self),
            },
            self.options.clone(),
        )
    }
}

type Job = (Arc<Source>, Token, usize);

fn producer(jobs: Receiver<Job>) {
    for (source, token, value) in jobs {
        // Every seventh operation is too slow and loses to the timeout.
        let delay = if value % 7 == 0 { 2_000 } else { 10 };
        thread::sleep(Duration::from_micros(delay));

        source
            .completer()
            .with_token(token)
            .with_data(Instant::now())
            .set_result(value);
    }
}

fn consumer(pool: Arc<Pool>, jobs: Sender<Job>, args: &Args) -> Result<(usize, usize)> {
    let (mut ok, mut timed_out) = (0, 0);
    let timeout = Duration::from_micros(args.timeout_us);

    for i in 0..args.iterations {
        let source = pool.get();
        let completion = source.arm(Some(timeout), None)?;

        jobs.send((source.clone(), completion.token(), i))
            .map_err(|_| anyhow!("producer hung up"))?;

        match completion.wait() {
            Ok(v) => {
                assert_eq!(v, i);
                ok += 1;
            }
            Err(Error::TimedOut(_)) => timed_out += 1,
            Err(e) => return Err(e.into()),
        }
    }

    Ok((ok, timed_out))
}

fn main() -> Result<()> {
    env_logger::init();

    let args = Arc::new(Args::parse());
    let pool = Pool::new(
        SourceOptions::new()
            .deferred_continuations(args.deferred)
            .label("pooled"),
    );

    let start = Instant::now();

    let workers: Vec<_> = (0..args.threads)
        .map(|_| {
            let (tx, rx) = channel();
            let pool = pool.clone();
            let args = args.clone();

            let producer = thread::spawn(move || producer(rx));
            let consumer = thread::spawn(move || consumer(pool, tx, &args));

            (producer, consumer)
        })
        .collect();

    let (mut ok, mut timed_out) = (0, 0);

    for (producer, consumer) in workers {
        let (o, t) = consumer.join().expect("consumer panicked")?;
        producer.join().expect("producer panicked");
        ok += o;
        timed_out += t;
    }

    info!("finished in {:?}", start.elapsed());

    println!(
        "{} operations: {ok} completed, {timed_out} timed out, {} sources allocated",
        ok + timed_out,
        pool.created.load(Ordering::Relaxed)
    );

    Ok(())
}
