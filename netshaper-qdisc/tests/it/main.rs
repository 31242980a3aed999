mod fairness;
mod concurrency;
